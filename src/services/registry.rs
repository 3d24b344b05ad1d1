//! At most one live session per bed, keyed by normalised address.

use crate::domain::models::DeviceIdentity;
use crate::domain::settings::BedConfig;
use crate::error::BedError;
use crate::infrastructure::bluetooth::protocol::format_address;
use crate::infrastructure::bluetooth::transport::BleTransport;
use crate::services::bed::OctoBed;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

struct Beds<T: BleTransport> {
    open: HashMap<String, Arc<OctoBed<T>>>,
    /// Addresses reserved by a `connect` still in flight.
    connecting: HashSet<String>,
}

impl<T: BleTransport> Beds<T> {
    fn is_taken(&self, key: &str) -> bool {
        self.open.contains_key(key) || self.connecting.contains(key)
    }
}

pub struct SessionRegistry<T: BleTransport> {
    beds: Mutex<Beds<T>>,
}

impl<T: BleTransport> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            beds: Mutex::new(Beds {
                open: HashMap::new(),
                connecting: HashSet::new(),
            }),
        }
    }
}

impl<T: BleTransport> SessionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an already assembled bed.
    pub async fn register(&self, bed: OctoBed<T>) -> Result<Arc<OctoBed<T>>, BedError> {
        let key = format_address(bed.address());
        let mut beds = self.beds.lock().await;
        if beds.is_taken(&key) {
            return Err(BedError::SessionAlreadyOpen(key));
        }

        let bed = Arc::new(bed);
        beds.open.insert(key.clone(), bed.clone());
        info!("Registered bed {}", key);
        Ok(bed)
    }

    /// Connect, authenticate and register in one step. The address is
    /// reserved before any radio traffic and the registry stays usable for
    /// other beds while the connection is set up.
    pub async fn connect(
        &self,
        transport: T,
        identity: DeviceIdentity,
        config: BedConfig,
    ) -> Result<Arc<OctoBed<T>>, BedError> {
        let key = format_address(&identity.address);
        {
            let mut beds = self.beds.lock().await;
            if beds.is_taken(&key) {
                return Err(BedError::SessionAlreadyOpen(key));
            }
            beds.connecting.insert(key.clone());
        }

        let result = OctoBed::connect(transport, identity, config).await;

        let mut beds = self.beds.lock().await;
        beds.connecting.remove(&key);
        match result {
            Ok(bed) => {
                let bed = Arc::new(bed);
                beds.open.insert(key.clone(), bed.clone());
                info!("Registered bed {}", key);
                Ok(bed)
            }
            Err(e) => {
                warn!("Could not register bed {}: {}", key, e);
                Err(e)
            }
        }
    }

    pub async fn get(&self, address: &str) -> Option<Arc<OctoBed<T>>> {
        self.beds
            .lock()
            .await
            .open
            .get(&format_address(address))
            .cloned()
    }

    /// Close and forget the bed at `address`. Returns whether one was open.
    pub async fn release(&self, address: &str) -> bool {
        let key = format_address(address);
        let Some(bed) = self.beds.lock().await.open.remove(&key) else {
            return false;
        };
        bed.close().await;
        info!("Released bed {}", key);
        true
    }

    pub async fn addresses(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.beds.lock().await.open.keys().cloned().collect();
        keys.sort();
        keys
    }
}
