//! IP/MAC reservation table.
//!
//! A reservation binds a client address to a MAC address and optionally to a
//! user (`keep`). Addresses are unique. MAC addresses are unique too, except
//! for [`PLACEHOLDER_MAC`], which stands in for "no MAC supplied" and may
//! appear on any number of reservations.

use crate::error::{ErrorContext, GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

/// MAC stored for reservations created without one.
pub const PLACEHOLDER_MAC: &str = "00:00:00:00:00:00";

/// A reservation row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpMap {
    /// Identity; 0 until stored.
    #[serde(default)]
    pub id: u64,
    pub ip_addr: String,
    #[serde(default)]
    pub mac_addr: String,
    /// Whether `mac_addr` is a real, uniquely bound address.
    #[serde(default)]
    pub unique_mac: bool,
    #[serde(default)]
    pub username: String,
    /// Keep the address bound to `username` between sessions.
    #[serde(default)]
    pub keep: bool,
    /// When `keep` was switched on.
    #[serde(default)]
    pub keep_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A hardware address: IEEE 802 MAC-48, EUI-64 or 20-octet IPoIB.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacAddr(Vec<u8>);

/// Octet counts of the accepted address kinds.
const MAC_LENGTHS: [usize; 3] = [6, 8, 20];

impl FromStr for MacAddr {
    type Err = GatewayError;

    /// Accepts colon, dash and dotted-quad notations in either case:
    /// `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff`, and their
    /// 8- and 20-octet equivalents.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GatewayError::Validation(format!("invalid MAC address: {}", s));

        let (groups, width): (Vec<&str>, usize) = if s.contains(':') {
            (s.split(':').collect(), 2)
        } else if s.contains('-') {
            (s.split('-').collect(), 2)
        } else if s.contains('.') {
            (s.split('.').collect(), 4)
        } else {
            return Err(invalid());
        };

        if !MAC_LENGTHS.contains(&(groups.len() * width / 2))
            || groups
                .iter()
                .any(|g| g.len() != width || !g.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(invalid());
        }

        let hex: String = groups.concat();
        let octets = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid()))
            .collect::<GatewayResult<Vec<u8>>>()?;
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, octet) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", octet)?;
        }
        Ok(())
    }
}

/// Persistent storage of reservations.
///
/// Implementations enforce address uniqueness and MAC uniqueness for
/// non-placeholder MACs, reporting violations as [`GatewayError::Conflict`].
pub trait IpMapStore: Send + Sync {
    /// Store a new row and return it with its assigned id.
    fn insert(&self, record: IpMap) -> GatewayResult<IpMap>;

    /// Replace the row with `record.id`.
    fn update(&self, record: IpMap) -> GatewayResult<IpMap>;

    fn get(&self, id: u64) -> GatewayResult<Option<IpMap>>;

    fn get_by_ip(&self, ip_addr: &str) -> GatewayResult<Option<IpMap>>;

    fn list(&self) -> GatewayResult<Vec<IpMap>>;

    /// Remove a row. Returns false if it did not exist.
    fn delete(&self, id: u64) -> GatewayResult<bool>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    records: BTreeMap<u64, IpMap>,
}

impl StoreState {
    fn check_unique(&self, record: &IpMap) -> GatewayResult<()> {
        for other in self.records.values().filter(|r| r.id != record.id) {
            if other.ip_addr == record.ip_addr {
                return Err(GatewayError::Conflict(format!(
                    "IP {} is already reserved (id {})",
                    record.ip_addr, other.id
                )));
            }
            if record.mac_addr != PLACEHOLDER_MAC && other.mac_addr == record.mac_addr {
                return Err(GatewayError::Conflict(format!(
                    "MAC {} is already bound to {} (id {})",
                    record.mac_addr, other.ip_addr, other.id
                )));
            }
        }
        Ok(())
    }
}

/// [`IpMapStore`] persisted as a single JSON file.
///
/// Every mutation rewrites the file through a temporary file and a rename,
/// so a crash leaves either the old or the new table on disk.
pub struct JsonIpMapStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonIpMapStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> GatewayResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            let json = std::fs::read_to_string(&path).map_err(|e| {
                GatewayError::storage_with_source(format!("Failed to read {}", path.display()), e)
            })?;
            serde_json::from_str(&json).map_err(|e| {
                GatewayError::storage_with_source(format!("Corrupt reservation table {}", path.display()), e)
            })?
        } else {
            StoreState::default()
        };

        log::debug!(
            "Opened reservation table {} ({} entries)",
            path.display(),
            state.records.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> GatewayResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| GatewayError::Storage(ErrorContext::new("reservation table lock poisoned")))
    }

    /// Apply `change` to a copy of the state, persist it, then commit.
    fn mutate<T>(&self, change: impl FnOnce(&mut StoreState) -> GatewayResult<T>) -> GatewayResult<T> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn persist(&self, state: &StoreState) -> GatewayResult<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| GatewayError::storage_with_source("Failed to encode reservation table", e))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                GatewayError::storage_with_source(format!("Failed to create {}", dir.display()), e)
            })?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json).map_err(|e| {
            GatewayError::storage_with_source(format!("Failed to write {}", tmp.display()), e)
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            GatewayError::storage_with_source(format!("Failed to replace {}", self.path.display()), e)
        })
    }
}

impl IpMapStore for JsonIpMapStore {
    fn insert(&self, mut record: IpMap) -> GatewayResult<IpMap> {
        self.mutate(|state| {
            state.next_id += 1;
            record.id = state.next_id;
            state.check_unique(&record)?;
            state.records.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn update(&self, record: IpMap) -> GatewayResult<IpMap> {
        self.mutate(|state| {
            if !state.records.contains_key(&record.id) {
                return Err(GatewayError::Validation(format!(
                    "no reservation with id {}",
                    record.id
                )));
            }
            state.check_unique(&record)?;
            state.records.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn get(&self, id: u64) -> GatewayResult<Option<IpMap>> {
        Ok(self.lock()?.records.get(&id).cloned())
    }

    fn get_by_ip(&self, ip_addr: &str) -> GatewayResult<Option<IpMap>> {
        Ok(self
            .lock()?
            .records
            .values()
            .find(|r| r.ip_addr == ip_addr)
            .cloned())
    }

    fn list(&self) -> GatewayResult<Vec<IpMap>> {
        Ok(self.lock()?.records.values().cloned().collect())
    }

    fn delete(&self, id: u64) -> GatewayResult<bool> {
        self.mutate(|state| Ok(state.records.remove(&id).is_some()))
    }
}

/// Validating front end of an [`IpMapStore`].
pub struct IpMapTable<S> {
    store: S,
}

impl<S: IpMapStore> IpMapTable<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate, normalize and upsert a reservation.
    ///
    /// - the IP must parse (IPv4 or IPv6); it is stored in canonical form
    /// - `keep` requires a username
    /// - a supplied MAC is normalized to `aa:bb:cc:dd:ee:ff`; without one,
    ///   [`PLACEHOLDER_MAC`] is stored
    ///
    /// Rows with `id == 0` are inserted, others updated by id.
    pub fn set_ip_map(&self, mut v: IpMap) -> GatewayResult<IpMap> {
        let ip_addr = v.ip_addr.trim();
        if ip_addr.len() < 4 {
            return Err(GatewayError::Validation(format!("invalid IP address: {:?}", v.ip_addr)));
        }
        let ip: IpAddr = ip_addr
            .parse()
            .map_err(|_| GatewayError::Validation(format!("invalid IP address: {}", ip_addr)))?;
        v.ip_addr = ip.to_string();

        if v.keep && v.username.trim().is_empty() {
            return Err(GatewayError::Validation(
                "a kept reservation requires a username".to_string(),
            ));
        }

        let mac = v.mac_addr.trim();
        if mac.is_empty() {
            v.mac_addr = PLACEHOLDER_MAC.to_string();
            v.unique_mac = false;
        } else {
            v.mac_addr = mac.parse::<MacAddr>()?.to_string();
            v.unique_mac = v.mac_addr != PLACEHOLDER_MAC;
        }

        let now = Utc::now();
        v.updated_at = Some(now);

        if v.id == 0 {
            v.keep_time = v.keep.then_some(now);
            let stored = self.store.insert(v)?;
            log::info!("Added reservation {} -> {}", stored.ip_addr, stored.mac_addr);
            return Ok(stored);
        }

        let existing = self.store.get(v.id)?;
        if let Some(existing) = &existing {
            v.keep_time = match (v.keep, existing.keep) {
                (false, _) => None,
                (true, true) => existing.keep_time.or(Some(now)),
                (true, false) => Some(now),
            };
            if v.last_login.is_none() {
                v.last_login = existing.last_login;
            }
        }
        let stored = self.store.update(v)?;
        log::info!("Updated reservation {} -> {}", stored.ip_addr, stored.mac_addr);
        Ok(stored)
    }

    pub fn get_by_ip(&self, ip_addr: &str) -> GatewayResult<Option<IpMap>> {
        self.store.get_by_ip(ip_addr)
    }

    pub fn list(&self) -> GatewayResult<Vec<IpMap>> {
        self.store.list()
    }

    pub fn delete(&self, id: u64) -> GatewayResult<bool> {
        self.store.delete(id)
    }
}
