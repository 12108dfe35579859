//! Device credential verification
//!
//! Every reading carries `hex(HMAC-SHA256(secret, canonical))` where
//! `canonical = "{device_id}|{metric}|{value}|{timestamp}|{sequence}"`.
//! Verification is a pure function of the device record and the request.
//! Device records are served from `DeviceKeyCache`, a read-mostly cache
//! refreshed at startup and kept current through provisioning events.

use super::error::{AuthError, StoreError};
use super::types::{DeviceRecord, DeviceStatus, IngestRequest};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Key used for unknown devices so rejection takes the same path as a mismatch
const UNKNOWN_DEVICE_KEY: &[u8] = b"wasteflow-unknown-device";

/// Source of device credentials (provisioning collaborator)
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Returns `Ok(None)` when the device is not provisioned
    async fn lookup_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;
}

/// Provisioning lifecycle events that refresh the key cache
#[derive(Debug, Clone)]
pub enum ProvisioningEvent {
    Registered(DeviceRecord),
    KeyRotated {
        device_id: String,
        secret: Vec<u8>,
        expires_at: Option<i64>,
    },
    Revoked {
        device_id: String,
    },
    Removed {
        device_id: String,
    },
}

pub fn canonical_message(
    device_id: &str,
    metric: &str,
    value: f64,
    timestamp: i64,
    sequence: u64,
) -> String {
    format!("{}|{}|{}|{}|{}", device_id, metric, value, timestamp, sequence)
}

fn compute_tag(secret: &[u8], message: &str) -> Vec<u8> {
    // HMAC accepts keys of any length
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return Vec::new();
    };
    mac.update(message.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Produce the hex tag a device attaches to a reading
pub fn sign_reading(
    secret: &[u8],
    device_id: &str,
    metric: &str,
    value: f64,
    timestamp: i64,
    sequence: u64,
) -> String {
    let message = canonical_message(device_id, metric, value, timestamp, sequence);
    hex::encode(compute_tag(secret, &message))
}

/// Verify a request against the device record it claims.
///
/// Check order: unknown → revoked → expired → malformed tag → mismatch.
pub fn verify(
    device: Option<&DeviceRecord>,
    request: &IngestRequest,
    now: i64,
) -> Result<(), AuthError> {
    let message = canonical_message(
        &request.device_id,
        &request.metric,
        request.value,
        request.timestamp,
        request.sequence,
    );

    let device = match device {
        Some(device) if device.device_id == request.device_id => device,
        _ => {
            let _ = compute_tag(UNKNOWN_DEVICE_KEY, &message);
            return Err(AuthError::UnknownDevice(request.device_id.clone()));
        }
    };

    if device.status == DeviceStatus::Revoked {
        return Err(AuthError::Revoked(device.device_id.clone()));
    }

    if let Some(expires_at) = device.expires_at {
        if now >= expires_at {
            return Err(AuthError::Expired {
                device_id: device.device_id.clone(),
                expired_at: expires_at,
            });
        }
    }

    let presented = hex::decode(request.auth_tag.trim())
        .map_err(|_| AuthError::MalformedTag(device.device_id.clone()))?;

    let expected = compute_tag(&device.secret, &message);

    // ct_eq on slices of different length is false without early exit on content
    if bool::from(expected.as_slice().ct_eq(presented.as_slice())) {
        Ok(())
    } else {
        Err(AuthError::TagMismatch(device.device_id.clone()))
    }
}

/// Process-wide read-mostly cache of device credentials
pub struct DeviceKeyCache {
    store: Arc<dyn DeviceStore>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    lookup_timeout: Duration,
}

impl DeviceKeyCache {
    pub fn new(store: Arc<dyn DeviceStore>, lookup_timeout: Duration) -> Self {
        Self {
            store,
            devices: RwLock::new(HashMap::new()),
            lookup_timeout,
        }
    }

    /// Replace the cache contents with every provisioned device
    pub async fn refresh_all(&self) -> Result<usize, StoreError> {
        let devices = tokio::time::timeout(self.lookup_timeout, self.store.list_devices())
            .await
            .map_err(|_| StoreError::Timeout(self.lookup_timeout))??;

        let count = devices.len();
        let map = devices
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect::<HashMap<_, _>>();

        match self.devices.write() {
            Ok(mut guard) => *guard = map,
            Err(poisoned) => *poisoned.into_inner() = map,
        }

        log::info!("🔑 Device key cache refreshed: {} devices", count);
        Ok(count)
    }

    pub fn apply_event(&self, event: ProvisioningEvent) {
        let mut guard = match self.devices.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match event {
            ProvisioningEvent::Registered(record) => {
                log::info!("🔑 Device registered: {}", record.device_id);
                guard.insert(record.device_id.clone(), record);
            }
            ProvisioningEvent::KeyRotated {
                device_id,
                secret,
                expires_at,
            } => match guard.get_mut(&device_id) {
                Some(record) => {
                    record.secret = secret;
                    record.expires_at = expires_at;
                    log::info!("🔑 Device key rotated: {}", device_id);
                }
                None => {
                    log::warn!("⚠️  Key rotation for unknown device {}", device_id);
                }
            },
            ProvisioningEvent::Revoked { device_id } => match guard.get_mut(&device_id) {
                Some(record) => {
                    record.status = DeviceStatus::Revoked;
                    log::warn!("🔒 Device revoked: {}", device_id);
                }
                None => {
                    log::warn!("⚠️  Revocation for unknown device {}", device_id);
                }
            },
            ProvisioningEvent::Removed { device_id } => {
                guard.remove(&device_id);
                log::info!("🔑 Device removed: {}", device_id);
            }
        }
    }

    fn cached(&self, device_id: &str) -> Option<DeviceRecord> {
        let guard = match self.devices.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(device_id).cloned()
    }

    /// Cached record, falling back to one store lookup on a miss.
    ///
    /// Positive lookups are cached; misses are not.
    pub async fn resolve(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        if let Some(record) = self.cached(device_id) {
            return Ok(Some(record));
        }

        let looked_up =
            tokio::time::timeout(self.lookup_timeout, self.store.lookup_device(device_id))
                .await
                .map_err(|_| StoreError::Timeout(self.lookup_timeout))??;

        if let Some(record) = &looked_up {
            log::debug!("🔑 Device {} loaded into key cache on miss", device_id);
            let mut guard = match self.devices.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard
                .entry(record.device_id.clone())
                .or_insert_with(|| record.clone());
        }

        Ok(looked_up)
    }

    pub fn len(&self) -> usize {
        match self.devices.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
