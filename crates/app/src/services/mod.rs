mod capability;
pub mod location;

pub use capability::Capability;
pub use location::{
    Coordinates, DEFAULT_GEOCODER_ENDPOINT, JurisdictionLocator, LocationError, NominatimLocator,
};
