/// An optional platform service that may be missing at runtime.
#[derive(Debug, Clone)]
pub enum Capability<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> Capability<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Available(service) => Some(service),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// Why the service is missing, or `None` when it is available.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Available(_) => None,
            Self::Unavailable { reason } => Some(reason),
        }
    }
}

impl<T> From<Option<T>> for Capability<T> {
    fn from(service: Option<T>) -> Self {
        match service {
            Some(service) => Self::Available(service),
            None => Self::unavailable("not configured"),
        }
    }
}
