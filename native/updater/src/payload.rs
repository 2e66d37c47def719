use std::{
    io::{self, Read},
    path::Path,
};

use derive_more::{Display, Error, From};
use tracing::{debug, instrument};
use zip::{CompressionMethod, ZipArchive, result::ZipError};

const PAYLOAD_ENTRY: &str = "payload.bin";
const PROPERTIES_ENTRY: &str = "payload_properties.txt";
const REQUIRED_HEADERS: [&str; 4] = ["FILE_HASH", "FILE_SIZE", "METADATA_HASH", "METADATA_SIZE"];

#[derive(Debug, Display, Error, From)]
pub enum PayloadError {
    #[from]
    #[display("failed to read package: {_0}")]
    Io(io::Error),
    #[from]
    #[display("not a valid zip archive: {_0}")]
    Zip(ZipError),
    #[display("package has no payload.bin")]
    MissingPayload,
    #[display("payload.bin must be stored uncompressed")]
    CompressedPayload,
    #[display("payload.bin lies outside the package")]
    PayloadOutOfBounds,
    #[display("package has no payload_properties.txt")]
    MissingProperties,
    #[display("malformed property line: {_0}")]
    MalformedProperty(#[error(not(source))] String),
    #[display("required header {_0} is missing")]
    MissingHeader(#[error(not(source))] &'static str),
}

/// Location of the payload inside an OTA package, as the update engine wants it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    /// `file://` URL of the package.
    pub url: String,
    /// Absolute offset of the payload bytes within the package.
    pub offset: u64,
    pub size: u64,
    /// `KEY=VALUE` lines from the properties entry.
    pub headers: Vec<String>,
}

impl PayloadInfo {
    #[instrument(err)]
    pub fn from_package(path: &Path) -> Result<Self, PayloadError> {
        let path = fs_err::canonicalize(path)?;
        let package_len = fs_err::metadata(&path)?.len();
        let mut archive = ZipArchive::new(fs_err::File::open(&path)?)?;

        let (offset, size) = {
            let entry = match archive.by_name(PAYLOAD_ENTRY) {
                Ok(entry) => entry,
                Err(ZipError::FileNotFound) => return Err(PayloadError::MissingPayload),
                Err(e) => return Err(e.into()),
            };
            if entry.compression() != CompressionMethod::Stored {
                return Err(PayloadError::CompressedPayload);
            }
            (entry.data_start(), entry.size())
        };
        if offset.checked_add(size).is_none_or(|end| end > package_len) {
            return Err(PayloadError::PayloadOutOfBounds);
        }

        let properties = {
            let mut entry = match archive.by_name(PROPERTIES_ENTRY) {
                Ok(entry) => entry,
                Err(ZipError::FileNotFound) => return Err(PayloadError::MissingProperties),
                Err(e) => return Err(e.into()),
            };
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            content
        };
        let headers = parse_properties(&properties)?;

        debug!(offset, size, headers = headers.len(), "Payload located");
        Ok(Self { url: format!("file://{}", path.display()), offset, size, headers })
    }
}

fn parse_properties(content: &str) -> Result<Vec<String>, PayloadError> {
    let headers = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('=') {
            Some((key, _)) if !key.trim().is_empty() => Ok(line.to_string()),
            _ => Err(PayloadError::MalformedProperty(line.to_string())),
        })
        .collect::<Result<Vec<_>, _>>()?;

    for key in REQUIRED_HEADERS {
        if !headers.iter().any(|h| h.split_once('=').is_some_and(|(k, _)| k.trim() == key)) {
            return Err(PayloadError::MissingHeader(key));
        }
    }
    Ok(headers)
}
