use std::io;

use aya::maps::MapError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("entry not found")]
    NotFound,
    #[error("bpf map error: {0}")]
    Map(#[source] MapError),
    #[error("unable to iterate connection map: {0}")]
    Iteration(#[source] Box<Error>),
    #[error("{0}")]
    Fault(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<MapError> for Error {
    fn from(err: MapError) -> Self {
        if matches!(err, MapError::KeyNotFound) || caused_by_enoent(&err) {
            return Error::NotFound;
        }
        Error::Map(err)
    }
}

// bpf_map_delete_elem reports a missing key as a syscall failure with ENOENT
fn caused_by_enoent(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return io_err.raw_os_error() == Some(libc::ENOENT);
        }
        source = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_not_found_folds_into_not_found() {
        let err: Error = MapError::KeyNotFound.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn enoent_in_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("delete failed")]
        struct Wrapper(#[source] io::Error);

        let err = Wrapper(io::Error::from_raw_os_error(libc::ENOENT));
        assert!(caused_by_enoent(&err));

        let err = Wrapper(io::Error::from_raw_os_error(libc::EPERM));
        assert!(!caused_by_enoent(&err));
    }

    #[test]
    fn iteration_wraps_cause() {
        let err = Error::Iteration(Box::new(Error::Fault("boom".into())));
        assert_eq!(err.to_string(), "unable to iterate connection map: boom");
    }
}
