//! Device position lookup used when publishing a message to the map.

use std::time::Duration;

use async_trait::async_trait;

use crate::models::LatLng;

/// Options passed to the position source. Defaults favour a fast, coarse fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    pub maximum_age: Duration,
}

impl Default for LocationOptions {
    fn default() -> Self {
        Self { high_accuracy: false, timeout: Duration::from_secs(10), maximum_age: Duration::from_secs(300) }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location unavailable")]
    Unavailable,
    #[error("location request timed out")]
    Timeout,
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(&self, opts: LocationOptions) -> Result<LatLng, LocationError>;
}

/// Always reports the same position.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub LatLng);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_position(&self, _opts: LocationOptions) -> Result<LatLng, LocationError> {
        Ok(self.0)
    }
}

/// Asks `provider` for a fix, giving up after `opts.timeout`.
pub async fn locate(provider: &dyn LocationProvider, opts: LocationOptions) -> Result<LatLng, LocationError> {
    match tokio::time::timeout(opts.timeout, provider.current_position(opts)).await {
        Ok(fix) => {
            let pos = fix?;
            if !pos.lat.is_finite() || !pos.lng.is_finite() {
                return Err(LocationError::Unavailable);
            }
            Ok(pos)
        }
        Err(_) => Err(LocationError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    #[async_trait]
    impl LocationProvider for Stalled {
        async fn current_position(&self, _opts: LocationOptions) -> Result<LatLng, LocationError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(LatLng { lat: 0.0, lng: 0.0 })
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let opts = LocationOptions { timeout: Duration::from_millis(20), ..Default::default() };
        assert_eq!(locate(&Stalled, opts).await, Err(LocationError::Timeout));
    }

    #[tokio::test]
    async fn fixed_location_passes_through() {
        let here = LatLng { lat: 52.23, lng: 21.01 };
        assert_eq!(locate(&FixedLocation(here), LocationOptions::default()).await, Ok(here));
    }

    #[tokio::test]
    async fn non_finite_fix_is_unavailable() {
        let nowhere = FixedLocation(LatLng { lat: f64::NAN, lng: 1.0 });
        assert_eq!(locate(&nowhere, LocationOptions::default()).await, Err(LocationError::Unavailable));
    }

    #[test]
    fn defaults_are_coarse() {
        let o = LocationOptions::default();
        assert!(!o.high_accuracy);
        assert_eq!(o.timeout, Duration::from_secs(10));
        assert_eq!(o.maximum_age, Duration::from_secs(300));
    }
}
