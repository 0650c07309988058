use crate::buffer::BufferError;
use crate::host::HostError;
use crate::mode::ModeError;
use crate::protocol::ParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VirtualOutputError {
    #[error("Virtual output {0:?} already exists")]
    DuplicateName(String),
    #[error("Virtual output {0:?} not found")]
    NotFound(String),
    #[error("Invalid dimensions {width}x{height}@{refresh} (sizes 64..=16384, refresh 1..=1000)")]
    InvalidDimensions { width: i64, height: i64, refresh: i64 },
    #[error("Allocation failed for {name:?}")]
    Allocation {
        name: String,
        #[source]
        source: AllocationFailure,
    },
    #[error("Property {property} on {name:?} could not be published")]
    Property {
        name: String,
        property: &'static str,
        #[source]
        source: HostError,
    },
    #[error("Virtual output {name:?} has no mode #{index}")]
    NoSuchMode { name: String, index: usize },
    #[error("Host refused to activate {name:?}")]
    Activation {
        name: String,
        #[source]
        source: HostError,
    },
    #[error("Malformed command")]
    Parse(#[from] ParseError),
    #[error("Control output is not active (state: {0})")]
    NotActive(&'static str),
}

/// What ran out while constructing or resizing an output.
#[derive(Debug, Error)]
pub enum AllocationFailure {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Mode(#[from] ModeError),
}

impl VirtualOutputError {
    pub(crate) fn allocation(name: &str, source: impl Into<AllocationFailure>) -> Self {
        Self::Allocation {
            name: name.to_string(),
            source: source.into(),
        }
    }
}
