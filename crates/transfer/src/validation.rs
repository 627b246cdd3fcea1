use crate::TransferError;

/// Validates a manifest-relative path before it touches the local disk or is
/// sent to the server as an upload `filepath`.
///
/// Manifest paths use `/`, but the server may resolve them on Windows, so
/// `\` is treated as a separator too and the checks do not depend on the
/// platform this runs on. Rejected:
/// - empty paths and paths containing NUL
/// - rooted paths (`/maps`, `\maps`) and UNC shares (`\\server\share`)
/// - drive-qualified paths (`C:\Songs`, `C:maps`)
/// - any `..` segment
pub fn validate_relative_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }
    if file_path.contains('\0') {
        return Err(TransferError::InvalidPath(format!(
            "NUL byte in path: {file_path:?}"
        )));
    }
    if file_path.starts_with(['/', '\\']) {
        return Err(TransferError::InvalidPath(format!(
            "rooted path not allowed: {file_path}"
        )));
    }

    if file_path
        .split(['/', '\\'])
        .next()
        .is_some_and(is_drive_qualified)
    {
        return Err(TransferError::InvalidPath(format!(
            "drive-qualified path not allowed: {file_path}"
        )));
    }
    if file_path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(TransferError::InvalidPath(format!(
            "parent directory traversal not allowed: {file_path}"
        )));
    }

    Ok(())
}

/// `C:` or `C:rest`, a drive letter that pins the path to a volume.
fn is_drive_qualified(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
