use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// Nothing free anywhere in the booking window for the allowed sites.
    NoFreeSlotsAhead,
    HorizonExhausted {
        max_days: u32,
    },
    NotCancelable(Ulid),
    /// The store reports more than one current slot for a patient.
    InconsistentCurrentSlots {
        patient_id: Ulid,
        count: usize,
    },
    InvalidConfig(&'static str),
    LimitExceeded(&'static str),
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NoFreeSlotsAhead => write!(f, "no free slots ahead"),
            EngineError::HorizonExhausted { max_days } => {
                write!(f, "no open slot within {max_days} days")
            }
            EngineError::NotCancelable(id) => write!(f, "slot {id} cannot be canceled"),
            EngineError::InconsistentCurrentSlots { patient_id, count } => {
                write!(f, "patient {patient_id} holds {count} current slots")
            }
            EngineError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}
