//! In-memory reference lease policy.
//!
//! [`Leases`] is a ready-made [`DhcpHandler`] for a single address pool:
//!
//! - IP allocation from the dynamic pool, honoring a requested address
//! - Pending offer tracking (pre-lease reservations)
//! - Lease creation, renewal, expiry and release
//! - Declined IP quarantine
//!
//! State lives only in memory and is lost when the process exits.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::{DhcpHandler, Offer, RequestDecision};
use crate::packet::DhcpMessage;

/// How long declined IPs remain unavailable (1 hour).
///
/// When a client sends DECLINE (indicating IP conflict), the IP is removed
/// from the pool for this duration to avoid repeatedly offering conflicting IPs.
const DECLINE_EXPIRATION_SECONDS: i64 = 3600;

/// How long a pending offer reserves an IP (60 seconds).
const OFFER_TIMEOUT_SECONDS: u64 = 60;

/// Encodes a client ID as a colon-separated hex string.
fn encode_client_id(client_id: &[u8]) -> String {
    client_id
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// An active DHCP lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// The IP address assigned to this client.
    pub ip_address: Ipv4Addr,

    /// Unique client identifier (hex-encoded).
    ///
    /// Derived from DHCP Option 61 if present, otherwise from
    /// hardware type + hardware address.
    pub client_id: String,

    /// Client-provided hostname (Option 12).
    pub hostname: Option<String>,

    /// When this lease expires (UTC).
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Creates a new lease with the specified duration.
    pub fn new(ip_address: Ipv4Addr, client_id: String, duration_seconds: u32) -> Self {
        Self {
            ip_address,
            client_id,
            hostname: None,
            expires_at: Utc::now() + TimeDelta::seconds(i64::from(duration_seconds)),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Renews the lease for the specified duration from now.
    pub fn renew(&mut self, duration_seconds: u32) {
        self.expires_at = Utc::now() + TimeDelta::seconds(i64::from(duration_seconds));
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// A pending IP offer awaiting client REQUEST.
#[derive(Debug, Clone)]
struct PendingOffer {
    ip: Ipv4Addr,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct InternalState {
    /// Active leases indexed by client ID.
    leases: HashMap<String, Lease>,
    /// Reverse lookup: IP address → client ID.
    ip_to_client: HashMap<Ipv4Addr, String>,
    /// Available IPs in the pool (sorted for deterministic allocation).
    free_ips: BTreeSet<Ipv4Addr>,
    /// Pending offers by client ID (not yet committed leases).
    pending_offers: HashMap<String, PendingOffer>,
    /// IPs currently in pending offers.
    pending_ips: HashSet<Ipv4Addr>,
    /// IPs that were declined, with timestamp of decline.
    declined_ips: HashMap<Ipv4Addr, DateTime<Utc>>,
}

impl InternalState {
    fn cleanup_pending_offers(&mut self) {
        let now = Instant::now();
        let expired_ips: Vec<Ipv4Addr> = self
            .pending_offers
            .values()
            .filter(|offer| offer.expires_at <= now)
            .map(|offer| offer.ip)
            .collect();
        for ip in expired_ips {
            self.pending_ips.remove(&ip);
        }
        self.pending_offers.retain(|_, offer| offer.expires_at > now);
    }

    fn cleanup_expired_leases(&mut self, config: &Config) -> usize {
        let expired_clients: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_expired())
            .map(|(client, _)| client.clone())
            .collect();

        let count = expired_clients.len();

        for client in expired_clients {
            if let Some(lease) = self.leases.remove(&client) {
                self.ip_to_client.remove(&lease.ip_address);
                if config.ip_in_pool(lease.ip_address) {
                    self.free_ips.insert(lease.ip_address);
                }
            }
        }

        count
    }

    fn cleanup_expired_declines(&mut self, config: &Config) {
        let now = Utc::now();
        let expired: Vec<Ipv4Addr> = self
            .declined_ips
            .iter()
            .filter(|(_, declined_at)| {
                now.signed_duration_since(**declined_at).num_seconds() >= DECLINE_EXPIRATION_SECONDS
            })
            .map(|(ip, _)| *ip)
            .collect();

        for ip in expired {
            self.declined_ips.remove(&ip);
            if config.ip_in_pool(ip) && !self.ip_to_client.contains_key(&ip) {
                self.free_ips.insert(ip);
            }
        }
    }

    /// Expects expired offers, leases and declines to be cleaned up first.
    fn is_available(&self, ip: Ipv4Addr, key: &str) -> bool {
        if self.declined_ips.contains_key(&ip) {
            return false;
        }

        let pending_for_other = self
            .pending_offers
            .iter()
            .any(|(pending_key, offer)| offer.ip == ip && pending_key != key);
        if pending_for_other {
            return false;
        }

        match self.ip_to_client.get(&ip) {
            None => true,
            Some(client) => client == key,
        }
    }

    fn track_offer(&mut self, key: String, ip: Ipv4Addr) {
        if let Some(old_offer) = self.pending_offers.remove(&key) {
            self.pending_ips.remove(&old_offer.ip);
        }
        self.pending_offers.insert(
            key,
            PendingOffer {
                ip,
                expires_at: Instant::now() + Duration::from_secs(OFFER_TIMEOUT_SECONDS),
            },
        );
        self.pending_ips.insert(ip);
    }
}

/// Thread-safe in-memory lease manager for one address pool.
///
/// # Example
///
/// ```no_run
/// use dhcpwire::{Config, DhcpServer, Leases};
///
/// # async fn example() -> dhcpwire::Result<()> {
/// let config = Config::default();
/// let server = DhcpServer::from_config(&config, Leases::new(config.clone()));
/// server.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Leases {
    config: Config,
    state: Mutex<InternalState>,
}

impl Leases {
    /// Creates a lease manager whose free pool is `pool_start..=pool_end`.
    pub fn new(config: Config) -> Self {
        let free_ips = (u32::from(config.pool_start)..=u32::from(config.pool_end))
            .map(Ipv4Addr::from)
            .collect();

        Self {
            config,
            state: Mutex::new(InternalState {
                free_ips,
                ..Default::default()
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, InternalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the lease for a client, if one exists.
    pub fn get_lease(&self, client_id: &[u8]) -> Option<Lease> {
        let key = encode_client_id(client_id);
        self.lock().leases.get(&key).cloned()
    }

    /// Picks an address to offer a client (DISCOVER handling).
    ///
    /// # Allocation Priority
    ///
    /// 1. Existing non-expired lease for this client
    /// 2. Existing pending offer for this client
    /// 3. The client's requested address, if in the pool and available
    /// 4. First available IP from the free pool
    ///
    /// The returned IP is tracked as a pending offer for 60 seconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if no IPs are available.
    pub fn allocate_ip(&self, client_id: &[u8], requested: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        let key = encode_client_id(client_id);
        let mut state = self.lock();

        state.cleanup_pending_offers();

        if let Some(lease) = state.leases.get(&key)
            && !lease.is_expired()
            && self.config.ip_in_pool(lease.ip_address)
        {
            return Ok(lease.ip_address);
        }

        if let Some(offer) = state.pending_offers.get(&key) {
            return Ok(offer.ip);
        }

        state.cleanup_expired_leases(&self.config);
        state.cleanup_expired_declines(&self.config);

        if let Some(ip) = requested
            && self.config.ip_in_pool(ip)
            && state.is_available(ip, &key)
        {
            state.track_offer(key, ip);
            return Ok(ip);
        }

        let candidate = state
            .free_ips
            .iter()
            .copied()
            .find(|ip| !state.declined_ips.contains_key(ip) && !state.pending_ips.contains(ip));

        match candidate {
            Some(ip) => {
                state.track_offer(key, ip);
                Ok(ip)
            }
            None => Err(Error::PoolExhausted),
        }
    }

    /// Creates or updates a lease (REQUEST/ACK handling).
    ///
    /// Removes any pending offer for this client. If the client held a
    /// different IP, the old one returns to the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] if the IP is outside the pool
    /// - [`Error::AddressUnavailable`] if the IP is leased or offered to a
    ///   different client, or was recently declined
    pub fn create_lease(
        &self,
        client_id: &[u8],
        ip_address: Ipv4Addr,
        hostname: Option<String>,
    ) -> Result<Lease> {
        if !self.config.ip_in_pool(ip_address) {
            return Err(Error::AddressOutOfRange(ip_address));
        }

        let key = encode_client_id(client_id);
        let mut state = self.lock();

        state.cleanup_pending_offers();
        state.cleanup_expired_leases(&self.config);
        state.cleanup_expired_declines(&self.config);

        if !state.is_available(ip_address, &key) {
            return Err(Error::AddressUnavailable(ip_address));
        }

        if let Some(old_offer) = state.pending_offers.remove(&key) {
            state.pending_ips.remove(&old_offer.ip);
        }

        let mut lease = Lease::new(ip_address, key.clone(), self.config.lease_duration_seconds);
        lease.hostname = hostname;

        let old_ip = state
            .leases
            .get(&key)
            .filter(|old| old.ip_address != ip_address)
            .map(|old| old.ip_address);

        if let Some(old_ip) = old_ip {
            state.ip_to_client.remove(&old_ip);
            if self.config.ip_in_pool(old_ip) {
                state.free_ips.insert(old_ip);
            }
        }

        state.leases.insert(key.clone(), lease.clone());
        state.ip_to_client.insert(ip_address, key);
        state.free_ips.remove(&ip_address);

        Ok(lease)
    }

    /// Extends an existing lease by the configured duration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseNotFound`] if the client has no lease.
    pub fn renew_lease(&self, client_id: &[u8]) -> Result<Lease> {
        let key = encode_client_id(client_id);
        let mut state = self.lock();

        let lease = state
            .leases
            .get_mut(&key)
            .ok_or_else(|| Error::LeaseNotFound(key.clone()))?;

        lease.renew(self.config.lease_duration_seconds);
        Ok(lease.clone())
    }

    /// Releases a lease (RELEASE handling).
    ///
    /// Returns `false` if the client holds no lease on `ciaddr`.
    pub fn release_lease(&self, client_id: &[u8], ciaddr: Ipv4Addr) -> bool {
        let key = encode_client_id(client_id);
        let mut state = self.lock();

        let matches = state
            .leases
            .get(&key)
            .is_some_and(|lease| lease.ip_address == ciaddr);
        if !matches {
            return false;
        }

        if let Some(lease) = state.leases.remove(&key) {
            state.ip_to_client.remove(&lease.ip_address);
            if self.config.ip_in_pool(lease.ip_address) {
                state.free_ips.insert(lease.ip_address);
            }
        }

        true
    }

    /// Checks if an IP is available for a specific client.
    ///
    /// An IP is available if:
    /// - It's not declined (or decline has expired)
    /// - It's not pending for a different client
    /// - It's not leased to a different client (or is leased to this client)
    pub fn is_ip_available(&self, ip: Ipv4Addr, client_id: &[u8]) -> bool {
        let key = encode_client_id(client_id);
        let mut state = self.lock();

        state.cleanup_pending_offers();
        state.cleanup_expired_leases(&self.config);
        state.cleanup_expired_declines(&self.config);
        state.is_available(ip, &key)
    }

    /// Marks an IP as declined (DECLINE handling).
    ///
    /// The IP is removed from the pool for 1 hour. Returns `true` if the
    /// decline was accepted (IP was in pool or leased to this client).
    pub fn decline_ip(&self, ip: Ipv4Addr, client_id: &[u8]) -> bool {
        let key = encode_client_id(client_id);
        let mut state = self.lock();

        let can_decline = match state.ip_to_client.get(&ip) {
            None => self.config.ip_in_pool(ip),
            Some(leased_client) => *leased_client == key,
        };

        if !can_decline {
            return false;
        }

        state.declined_ips.insert(ip, Utc::now());
        state.free_ips.remove(&ip);

        let should_remove = state
            .leases
            .get(&key)
            .is_some_and(|lease| lease.ip_address == ip);

        if should_remove {
            state.leases.remove(&key);
            state.ip_to_client.remove(&ip);
        }

        true
    }

    /// Removes all expired leases and returns their IPs to the pool.
    ///
    /// Returns the number of leases cleaned up.
    pub fn cleanup_expired_leases(&self) -> usize {
        self.lock().cleanup_expired_leases(&self.config)
    }

    /// Returns the count of non-expired leases.
    pub fn active_lease_count(&self) -> usize {
        self.lock()
            .leases
            .values()
            .filter(|lease| !lease.is_expired())
            .count()
    }

    /// Returns the count of available IPs in the pool.
    pub fn free_ip_count(&self) -> usize {
        self.lock().free_ips.len()
    }
}

impl DhcpHandler for Leases {
    fn on_discover(&self, message: &DhcpMessage) -> Option<Offer> {
        let mac = message.format_mac();
        let requested = message.requested_ip().unwrap_or_else(|error| {
            warn!("Ignoring requested address from {}: {}", mac, error);
            None
        });

        match self.allocate_ip(&message.client_id(), requested) {
            Ok(address) => Some(Offer {
                address,
                lease_seconds: self.config.lease_duration_seconds,
            }),
            Err(error) => {
                warn!("Cannot offer IP to {}: {}", mac, error);
                None
            }
        }
    }

    fn on_request(&self, message: &DhcpMessage) -> Option<RequestDecision> {
        let mac = message.format_mac();
        let requested = match message.requested_ip() {
            Ok(requested) => requested,
            Err(error) => {
                warn!("NAK to {}: {}", mac, error);
                return Some(RequestDecision::Nak {
                    message: error.to_string(),
                });
            }
        };

        let ciaddr = message.ciaddr();
        let Some(address) = requested.or((!ciaddr.is_unspecified()).then_some(ciaddr)) else {
            warn!("NAK to {}: no requested address", mac);
            return Some(RequestDecision::Nak {
                message: "no requested address".to_string(),
            });
        };

        let client_id = message.client_id();
        let is_renewal = self
            .get_lease(&client_id)
            .is_some_and(|lease| lease.ip_address == address && !lease.is_expired());

        let result = if is_renewal {
            match self.renew_lease(&client_id) {
                Err(Error::LeaseNotFound(_)) => {
                    self.create_lease(&client_id, address, message.hostname())
                }
                renewed => renewed,
            }
        } else {
            self.create_lease(&client_id, address, message.hostname())
        };

        match result {
            Ok(lease) => {
                debug!(
                    "Lease {} for {} valid for {} seconds",
                    lease.ip_address,
                    mac,
                    lease.remaining_seconds()
                );
                Some(RequestDecision::Ack {
                    address,
                    lease_seconds: self.config.lease_duration_seconds,
                })
            }
            Err(error) => {
                warn!("NAK to {}: {}", mac, error);
                Some(RequestDecision::Nak {
                    message: error.to_string(),
                })
            }
        }
    }

    fn on_release(&self, message: &DhcpMessage) {
        let mac = message.format_mac();
        let ciaddr = message.ciaddr();

        if self.release_lease(&message.client_id(), ciaddr) {
            info!("RELEASE from {} for {}", mac, ciaddr);
        } else {
            warn!("RELEASE from {} for {} does not match a lease", mac, ciaddr);
        }
    }

    fn on_decline(&self, message: &DhcpMessage) {
        let mac = message.format_mac();
        let Ok(Some(ip)) = message.requested_ip() else {
            warn!("DECLINE from {} without a requested address", mac);
            return;
        };

        if self.decline_ip(ip, &message.client_id()) {
            warn!(
                "DECLINE from {}: {} marked unavailable for {} seconds",
                mac, ip, DECLINE_EXPIRATION_SECONDS
            );
        } else {
            warn!("Ignoring DECLINE from {} for {}", mac, ip);
        }
    }

    fn on_inform(&self, message: &DhcpMessage) {
        debug!(
            "INFORM from {} ({}), no lease change",
            message.format_mac(),
            message.ciaddr()
        );
    }
}
