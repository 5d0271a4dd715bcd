pub type Result<T> = std::result::Result<T, FiddleError>;

/// Terminal status of a failed `interpret` call. Diagnostics are printed on
/// stderr at the point of detection, so the variants carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiddleError {
    Compile,
    Runtime,
}
