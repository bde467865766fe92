use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Http(reqwest::Error),

    #[from]
    Header(reqwest::header::InvalidHeaderValue),

    /// Registry or client used outside of a tokio runtime
    #[from]
    Runtime(tokio::runtime::TryCurrentError),

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for Error {}
