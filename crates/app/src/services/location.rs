use lexi_llm::BoxFuture;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

pub const DEFAULT_GEOCODER_ENDPOINT: &str = "https://nominatim.openstreetmap.org/reverse";

/// A validated latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Resolves coordinates to a free-form `"Region, Country"` jurisdiction.
///
/// Lookup failures are reported as `None`.
pub trait JurisdictionLocator: Send + Sync {
    fn lookup(&self, coordinates: Coordinates) -> BoxFuture<'_, Option<String>>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LocationError {
    #[snafu(display("failed to build geocoder client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("geocoder request failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("geocoder returned status {status} on `{stage}`"))]
    Status { stage: &'static str, status: u16 },
}

/// Reverse geocoding through an OpenStreetMap Nominatim endpoint.
pub struct NominatimLocator {
    client: reqwest::Client,
    endpoint: String,
}

impl NominatimLocator {
    pub fn new(endpoint: &str, user_agent: &str) -> Result<Self, LocationError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.trim())
            .build()
            .context(BuildClientSnafu {
                stage: "nominatim-build-client",
            })?;

        let endpoint = endpoint.trim();
        Ok(Self {
            client,
            endpoint: if endpoint.is_empty() {
                DEFAULT_GEOCODER_ENDPOINT.to_string()
            } else {
                endpoint.to_string()
            },
        })
    }

    async fn reverse(&self, coordinates: Coordinates) -> Result<Option<String>, LocationError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", coordinates.latitude().to_string()),
                ("lon", coordinates.longitude().to_string()),
                ("zoom", "5".to_string()),
                ("addressdetails", "1".to_string()),
            ])
            .send()
            .await
            .context(RequestSnafu {
                stage: "nominatim-send",
            })?;

        let status = response.status();
        if !status.is_success() {
            return StatusSnafu {
                stage: "nominatim-status",
                status: status.as_u16(),
            }
            .fail();
        }

        let payload = response
            .json::<ReverseResponse>()
            .await
            .context(RequestSnafu {
                stage: "nominatim-decode",
            })?;

        Ok(payload.address.as_ref().and_then(format_jurisdiction))
    }
}

impl JurisdictionLocator for NominatimLocator {
    fn lookup(&self, coordinates: Coordinates) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move {
            match self.reverse(coordinates).await {
                Ok(jurisdiction) => jurisdiction,
                Err(error) => {
                    tracing::warn!(error = %error, "jurisdiction lookup failed");
                    None
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<Address>,
}

#[derive(Debug, Default, Deserialize)]
struct Address {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    province: Option<String>,
    #[serde(default)]
    county: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

fn format_jurisdiction(address: &Address) -> Option<String> {
    let non_blank = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let region = non_blank(&address.state)
        .or_else(|| non_blank(&address.region))
        .or_else(|| non_blank(&address.province))
        .or_else(|| non_blank(&address.county))
        .or_else(|| non_blank(&address.city));
    let country = non_blank(&address.country);

    match (region, country) {
        (Some(region), Some(country)) => Some(format!("{region}, {country}")),
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_address(json: &str) -> Address {
        serde_json::from_str::<ReverseResponse>(json)
            .expect("json")
            .address
            .unwrap_or_default()
    }

    #[test]
    fn coordinates_are_range_checked() {
        assert!(Coordinates::new(37.77, -122.42).is_some());
        assert!(Coordinates::new(91.0, 0.0).is_none());
        assert!(Coordinates::new(0.0, -180.5).is_none());
        assert!(Coordinates::new(f64::NAN, 0.0).is_none());
    }

    #[test]
    fn state_and_country_are_joined() {
        let address = parse_address(
            r#"{"address":{"city":"San Francisco","state":"California","country":"United States","country_code":"us"}}"#,
        );
        assert_eq!(
            format_jurisdiction(&address).as_deref(),
            Some("California, United States")
        );
    }

    #[test]
    fn region_falls_back_through_smaller_units() {
        let address = parse_address(r#"{"address":{"county":"Dublin","country":"Ireland"}}"#);
        assert_eq!(format_jurisdiction(&address).as_deref(), Some("Dublin, Ireland"));

        let address = parse_address(r#"{"address":{"country":" "}}"#);
        assert_eq!(format_jurisdiction(&address), None);

        let address = parse_address(r#"{"error":"Unable to geocode"}"#);
        assert_eq!(format_jurisdiction(&address), None);
    }
}
