//! Per-tenant bounded pool of automation sessions.
//!
//! Admission is atomic under one async mutex; waiters queue FIFO per tenant
//! and a newcomer never jumps the queue. A caller that times out removes its
//! queue entry under the lock, so no reservation can leak.

use crate::engine::{EngineHandle, EngineVariant, SessionFactory};
use pagevault_core::{Error, PoolConfig, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// A checked-out session. The engine handle moves into the lease while the
/// session is out, so it cannot be aliased from the pool, and `release`
/// consumes the lease, so a session cannot be returned twice.
pub struct SessionLease {
    session_id: String,
    tenant_id: String,
    variant: EngineVariant,
    handle: Box<dyn EngineHandle>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .field("tenant_id", &self.tenant_id)
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn variant(&self) -> EngineVariant {
        self.variant
    }

    pub fn handle(&self) -> &dyn EngineHandle {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> &mut (dyn EngineHandle + 'static) {
        self.handle.as_mut()
    }
}

/// Usage figures derived from live slot state and per-tenant counters;
/// recomputed on demand, never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageMetrics {
    pub session_count: usize,
    pub memory_estimate_bytes: u64,
    pub avg_lifetime_secs: f64,
    pub error_rate: f64,
}

enum SlotState {
    Idle(Box<dyn EngineHandle>),
    CheckedOut,
}

struct Slot {
    variant: EngineVariant,
    created_at: Instant,
    last_used: Instant,
    memory_estimate: u64,
    state: SlotState,
}

impl Slot {
    fn is_idle(&self) -> bool {
        matches!(self.state, SlotState::Idle(_))
    }

    fn take_idle(&mut self) -> Option<Box<dyn EngineHandle>> {
        if !self.is_idle() {
            return None;
        }
        match std::mem::replace(&mut self.state, SlotState::CheckedOut) {
            SlotState::Idle(handle) => Some(handle),
            SlotState::CheckedOut => None,
        }
    }
}

#[derive(Default)]
struct TenantStats {
    created: u64,
    destroyed: u64,
    unhealthy: u64,
    lifetime_total: Duration,
}

struct Waiter {
    id: u64,
    wake: Arc<Notify>,
}

#[derive(Default)]
struct TenantState {
    slots: HashMap<String, Slot>,
    /// Slots promised to in-flight session creation, counted against the cap.
    reserved: usize,
    waiters: VecDeque<Waiter>,
    stats: TenantStats,
}

impl TenantState {
    fn occupied(&self) -> usize {
        self.slots.len() + self.reserved
    }

    fn wake_front(&self) {
        if let Some(waiter) = self.waiters.front() {
            waiter.wake.notify_one();
        }
    }

    fn remove_waiter(&mut self, id: u64) {
        self.waiters.retain(|w| w.id != id);
    }
}

#[derive(Default)]
struct PoolState {
    tenants: HashMap<String, TenantState>,
    next_waiter: u64,
}

enum Admission {
    Lease(SessionLease),
    Create,
    Reclaim(Box<dyn EngineHandle>),
    Wait(Arc<Notify>),
}

pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    stop_wake: Notify,
    stopped: AtomicBool,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            state: Mutex::new(PoolState::default()),
            stop_wake: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Check out a session for the tenant, reusing an idle one of the same
    /// variant when possible. Blocks behind earlier waiters; fails with
    /// `SessionPoolExhausted` once the acquire timeout elapses.
    pub async fn acquire(&self, tenant_id: &str, variant: EngineVariant) -> Result<SessionLease> {
        let deadline = Instant::now() + self.config.acquire_timeout();
        let mut waiter: Option<(u64, Arc<Notify>)> = None;

        loop {
            let admission = {
                let mut guard = self.state.lock().await;
                let PoolState {
                    tenants,
                    next_waiter,
                } = &mut *guard;
                let tenant = tenants.entry(tenant_id.to_string()).or_default();

                let first_in_line = match (tenant.waiters.front(), &waiter) {
                    (None, _) => true,
                    (Some(front), Some((id, _))) => front.id == *id,
                    (Some(_), None) => false,
                };

                if first_in_line {
                    self.admit(tenant, next_waiter, tenant_id, variant, &mut waiter)
                } else {
                    Admission::Wait(enqueue(next_waiter, tenant, &mut waiter))
                }
            };

            match admission {
                Admission::Lease(lease) => return Ok(lease),
                Admission::Create => return self.create_session(tenant_id, variant).await,
                Admission::Reclaim(mut handle) => {
                    handle.dispose().await;
                    return self.create_session(tenant_id, variant).await;
                }
                Admission::Wait(notify) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let woken = !remaining.is_zero()
                        && tokio::time::timeout(remaining, notify.notified()).await.is_ok();
                    if !woken {
                        let mut guard = self.state.lock().await;
                        if let Some(tenant) = guard.tenants.get_mut(tenant_id) {
                            if let Some((id, _)) = &waiter {
                                tenant.remove_waiter(*id);
                            }
                            // A release may have signaled us right as the
                            // timeout fired; pass the wake along.
                            tenant.wake_front();
                        }
                        return Err(Error::SessionPoolExhausted(format!(
                            "tenant {} at capacity {}, no session freed within {:?}",
                            tenant_id,
                            self.config.max_sessions_per_tenant,
                            self.config.acquire_timeout()
                        )));
                    }
                }
            }
        }
    }

    /// Admission decision for the caller at the front of the line. Called
    /// with the state lock held. On success the caller's queue entry is
    /// removed and the next waiter signaled so pending capacity keeps
    /// draining in order.
    fn admit(
        &self,
        tenant: &mut TenantState,
        next_waiter: &mut u64,
        tenant_id: &str,
        variant: EngineVariant,
        waiter: &mut Option<(u64, Arc<Notify>)>,
    ) -> Admission {
        // Prefer the most recently used idle session of the right variant.
        let reusable = tenant
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_idle() && slot.variant == variant)
            .max_by_key(|(_, slot)| slot.last_used)
            .map(|(id, _)| id.clone());
        if let Some(session_id) = reusable {
            if let Some(handle) = tenant
                .slots
                .get_mut(&session_id)
                .and_then(|slot| slot.take_idle())
            {
                if let Some(slot) = tenant.slots.get_mut(&session_id) {
                    slot.last_used = Instant::now();
                }
                leave_queue(tenant, waiter);
                debug!(tenant = tenant_id, session = %session_id, "Idle session reused");
                return Admission::Lease(SessionLease {
                    session_id,
                    tenant_id: tenant_id.to_string(),
                    variant,
                    handle,
                });
            }
        }

        if tenant.occupied() < self.config.max_sessions_per_tenant {
            tenant.reserved += 1;
            leave_queue(tenant, waiter);
            return Admission::Create;
        }

        // At cap with no matching idle session: evict the least recently
        // used idle session of another variant to make room.
        let victim = tenant
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_idle())
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(id, _)| id.clone());
        if let Some(session_id) = victim {
            if let Some(slot) = tenant.slots.remove(&session_id) {
                if let SlotState::Idle(handle) = slot.state {
                    tenant.stats.destroyed += 1;
                    tenant.stats.lifetime_total += slot.created_at.elapsed();
                    tenant.reserved += 1;
                    leave_queue(tenant, waiter);
                    debug!(
                        tenant = tenant_id,
                        session = %session_id,
                        evicted = slot.variant.as_str(),
                        requested = variant.as_str(),
                        "Idle session evicted for variant switch"
                    );
                    return Admission::Reclaim(handle);
                }
            }
        }

        Admission::Wait(enqueue(next_waiter, tenant, waiter))
    }

    async fn create_session(
        &self,
        tenant_id: &str,
        variant: EngineVariant,
    ) -> Result<SessionLease> {
        let created = self.factory.create(tenant_id, variant).await;

        let mut guard = self.state.lock().await;
        let tenant = guard.tenants.entry(tenant_id.to_string()).or_default();
        tenant.reserved = tenant.reserved.saturating_sub(1);
        match created {
            Ok(handle) => {
                let session_id = uuid::Uuid::new_v4().to_string();
                let now = Instant::now();
                tenant.slots.insert(
                    session_id.clone(),
                    Slot {
                        variant,
                        created_at: now,
                        last_used: now,
                        memory_estimate: handle.memory_estimate_bytes(),
                        state: SlotState::CheckedOut,
                    },
                );
                tenant.stats.created += 1;
                info!(
                    tenant = tenant_id,
                    session = %session_id,
                    variant = variant.as_str(),
                    "Automation session created"
                );
                Ok(SessionLease {
                    session_id,
                    tenant_id: tenant_id.to_string(),
                    variant,
                    handle,
                })
            }
            Err(e) => {
                // The reservation is gone; let the next waiter try.
                tenant.wake_front();
                warn!(tenant = tenant_id, error = %e, "Session launch failed");
                Err(e)
            }
        }
    }

    /// Return a session. Healthy sessions go back to the idle set; unhealthy
    /// ones are destroyed and the slot freed.
    pub async fn release(&self, lease: SessionLease) {
        let SessionLease {
            session_id,
            tenant_id,
            mut handle,
            ..
        } = lease;

        let healthy = handle.is_healthy();
        if !healthy {
            handle.dispose().await;
        }

        let mut orphan: Option<Box<dyn EngineHandle>> = None;
        {
            let mut guard = self.state.lock().await;
            let Some(tenant) = guard.tenants.get_mut(&tenant_id) else {
                return;
            };
            if healthy {
                match tenant.slots.get_mut(&session_id) {
                    Some(slot) => {
                        slot.last_used = Instant::now();
                        slot.memory_estimate = handle.memory_estimate_bytes();
                        slot.state = SlotState::Idle(handle);
                    }
                    None => orphan = Some(handle),
                }
            } else if let Some(slot) = tenant.slots.remove(&session_id) {
                tenant.stats.destroyed += 1;
                tenant.stats.unhealthy += 1;
                tenant.stats.lifetime_total += slot.created_at.elapsed();
                warn!(tenant = %tenant_id, session = %session_id, "Unhealthy session destroyed");
            }
            tenant.wake_front();
        }
        if let Some(mut handle) = orphan {
            handle.dispose().await;
        }
    }

    /// Destroy idle sessions past the maximum idle age. The only path that
    /// reclaims healthy-but-unused sessions.
    pub async fn cleanup(&self) -> usize {
        let max_idle = self.config.max_idle();
        let mut disposed: Vec<Box<dyn EngineHandle>> = Vec::new();
        {
            let mut guard = self.state.lock().await;
            for (tenant_id, tenant) in guard.tenants.iter_mut() {
                let expired: Vec<String> = tenant
                    .slots
                    .iter()
                    .filter(|(_, slot)| slot.is_idle() && slot.last_used.elapsed() >= max_idle)
                    .map(|(id, _)| id.clone())
                    .collect();
                if expired.is_empty() {
                    continue;
                }
                for session_id in expired {
                    if let Some(slot) = tenant.slots.remove(&session_id) {
                        if let SlotState::Idle(handle) = slot.state {
                            tenant.stats.destroyed += 1;
                            tenant.stats.lifetime_total += slot.created_at.elapsed();
                            disposed.push(handle);
                            debug!(tenant = %tenant_id, session = %session_id, "Idle session reclaimed");
                        }
                    }
                }
                tenant.wake_front();
            }
        }
        let count = disposed.len();
        for mut handle in disposed {
            handle.dispose().await;
        }
        count
    }

    /// Drive periodic cleanup until `stop()`.
    pub async fn run_cleanup(&self) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop_wake.notified() => {}
            }
            if self.stopped.load(Ordering::SeqCst) {
                info!("Pool cleanup stopped");
                return;
            }
            let reclaimed = self.cleanup().await;
            if reclaimed > 0 {
                debug!(reclaimed, "Cleanup pass reclaimed idle sessions");
            }
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_wake.notify_one();
    }

    /// Dispose every idle session and forget all slots. Outstanding leases
    /// keep their handles; their release becomes a no-op.
    pub async fn close_all(&self) {
        let mut disposed: Vec<Box<dyn EngineHandle>> = Vec::new();
        {
            let mut guard = self.state.lock().await;
            for tenant in guard.tenants.values_mut() {
                for (_, slot) in tenant.slots.drain() {
                    if let SlotState::Idle(handle) = slot.state {
                        disposed.push(handle);
                    }
                }
                tenant.reserved = 0;
                for waiter in tenant.waiters.drain(..) {
                    waiter.wake.notify_one();
                }
            }
        }
        for mut handle in disposed {
            handle.dispose().await;
        }
    }

    /// Usage aggregated across every tenant, or scoped to one.
    pub async fn usage(&self, tenant_id: Option<&str>) -> UsageMetrics {
        let guard = self.state.lock().await;
        let mut metrics = UsageMetrics::default();
        let mut lifetime_total = Duration::ZERO;
        let mut lifetime_samples: u64 = 0;
        let mut created: u64 = 0;
        let mut unhealthy: u64 = 0;

        for (id, tenant) in &guard.tenants {
            if tenant_id.is_some_and(|t| t != id) {
                continue;
            }
            metrics.session_count += tenant.slots.len();
            metrics.memory_estimate_bytes += tenant
                .slots
                .values()
                .map(|slot| slot.memory_estimate)
                .sum::<u64>();
            lifetime_total += tenant.stats.lifetime_total
                + tenant
                    .slots
                    .values()
                    .map(|slot| slot.created_at.elapsed())
                    .sum::<Duration>();
            lifetime_samples += tenant.stats.destroyed + tenant.slots.len() as u64;
            created += tenant.stats.created;
            unhealthy += tenant.stats.unhealthy;
        }

        if lifetime_samples > 0 {
            metrics.avg_lifetime_secs = lifetime_total.as_secs_f64() / lifetime_samples as f64;
        }
        if created > 0 {
            metrics.error_rate = unhealthy as f64 / created as f64;
        }
        metrics
    }
}

fn enqueue(
    next_waiter: &mut u64,
    tenant: &mut TenantState,
    waiter: &mut Option<(u64, Arc<Notify>)>,
) -> Arc<Notify> {
    if let Some((_, notify)) = waiter {
        return notify.clone();
    }
    let id = *next_waiter;
    *next_waiter += 1;
    let notify = Arc::new(Notify::new());
    tenant.waiters.push_back(Waiter {
        id,
        wake: notify.clone(),
    });
    *waiter = Some((id, notify.clone()));
    notify
}

/// Remove the caller's queue entry after a successful admission and signal
/// the next waiter; extra wakeups are harmless, missed ones would strand a
/// waiter behind capacity that already freed up.
fn leave_queue(tenant: &mut TenantState, waiter: &mut Option<(u64, Arc<Notify>)>) {
    if let Some((id, _)) = waiter.take() {
        tenant.remove_waiter(id);
        tenant.wake_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FakeEngine {
        healthy: Arc<AtomicBool>,
        disposed: Arc<AtomicUsize>,
        memory: u64,
    }

    #[async_trait]
    impl EngineHandle for FakeEngine {
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn memory_estimate_bytes(&self) -> u64 {
            self.memory
        }

        async fn dispose(&mut self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created: AtomicUsize,
        disposed: Arc<AtomicUsize>,
        healthy: Arc<AtomicBool>,
        fail: AtomicBool,
        delay: Option<Duration>,
    }

    impl FakeFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                healthy: Arc::new(AtomicBool::new(true)),
                ..Default::default()
            })
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn disposed(&self) -> usize {
            self.disposed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn create(
            &self,
            _tenant_id: &str,
            _variant: EngineVariant,
        ) -> Result<Box<dyn EngineHandle>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Session("engine binary not found".to_string()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeEngine {
                healthy: self.healthy.clone(),
                disposed: self.disposed.clone(),
                memory: 256 * 1024 * 1024,
            }))
        }
    }

    fn pool_with(factory: Arc<FakeFactory>, cap: usize, timeout_ms: u64) -> SessionPool {
        SessionPool::new(
            factory,
            PoolConfig {
                max_sessions_per_tenant: cap,
                acquire_timeout_ms: timeout_ms,
                max_idle_secs: 300,
                cleanup_interval_secs: 60,
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_reuses_idle_session() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), 2, 1000);

        let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        let first_id = lease.session_id().to_string();
        pool.release(lease).await;

        let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        assert_eq!(lease.session_id(), first_id);
        assert_eq!(factory.created(), 1);
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn test_second_acquire_at_cap_times_out() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), 1, 80);

        let held = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        let start = Instant::now();
        let err = pool.acquire("acme", EngineVariant::Chrome).await.unwrap_err();
        assert!(matches!(err, Error::SessionPoolExhausted(_)));
        assert!(start.elapsed() >= Duration::from_millis(80));
        // No second session was ever created.
        assert_eq!(factory.created(), 1);
        pool.release(held).await;
    }

    #[tokio::test]
    async fn test_waiter_gets_session_on_release() {
        let factory = FakeFactory::new();
        let pool = Arc::new(pool_with(factory.clone(), 1, 2000));

        let held = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            waiter_pool.acquire("acme", EngineVariant::Chrome).await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.release(held).await;

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(factory.created(), 1);
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn test_cap_never_exceeded_under_concurrency() {
        let factory = FakeFactory::new();
        let pool = Arc::new(pool_with(factory.clone(), 3, 5000));
        let concurrent = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                let concurrent = concurrent.clone();
                tokio::spawn(async move {
                    let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    assert!(now <= 3, "cap exceeded: {} sessions checked out", now);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    pool.release(lease).await;
                })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        assert!(factory.created() <= 3);
        assert_eq!(pool.usage(Some("acme")).await.session_count, factory.created());
    }

    #[tokio::test]
    async fn test_tenants_do_not_starve_each_other() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), 1, 100);

        let _held = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        // acme is saturated; globex still gets a session immediately.
        let other = pool.acquire("globex", EngineVariant::Chrome).await.unwrap();
        assert_eq!(factory.created(), 2);
        pool.release(other).await;
    }

    #[tokio::test]
    async fn test_unhealthy_session_is_destroyed_on_release() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), 2, 1000);

        let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        factory.healthy.store(false, Ordering::SeqCst);
        pool.release(lease).await;

        assert_eq!(factory.disposed(), 1);
        let usage = pool.usage(Some("acme")).await;
        assert_eq!(usage.session_count, 0);
        assert!(usage.error_rate > 0.99);

        // A fresh acquire launches a new session rather than reusing.
        factory.healthy.store(true, Ordering::SeqCst);
        let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        assert_eq!(factory.created(), 2);
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_reservation() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), 1, 60);

        let held = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        assert!(pool.acquire("acme", EngineVariant::Chrome).await.is_err());
        pool.release(held).await;

        // The timed-out waiter left nothing behind; the slot is free.
        let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        assert_eq!(factory.created(), 1);
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_idle_sessions() {
        let factory = FakeFactory::new();
        let pool = SessionPool::new(
            factory.clone(),
            PoolConfig {
                max_sessions_per_tenant: 2,
                acquire_timeout_ms: 1000,
                max_idle_secs: 0,
                cleanup_interval_secs: 60,
            },
        );

        let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        pool.release(lease).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.cleanup().await, 1);
        assert_eq!(factory.disposed(), 1);
        assert_eq!(pool.usage(None).await.session_count, 0);
    }

    #[tokio::test]
    async fn test_variant_switch_evicts_idle_session_at_cap() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), 1, 1000);

        let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        pool.release(lease).await;

        let lease = pool.acquire("acme", EngineVariant::Firefox).await.unwrap();
        assert_eq!(lease.variant(), EngineVariant::Firefox);
        // The idle Chrome session was disposed to stay within the cap.
        assert_eq!(factory.disposed(), 1);
        assert_eq!(factory.created(), 2);
        assert_eq!(pool.usage(Some("acme")).await.session_count, 1);
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn test_factory_failure_frees_the_reservation() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), 1, 1000);

        factory.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            pool.acquire("acme", EngineVariant::Chrome).await,
            Err(Error::Session(_))
        ));

        factory.fail.store(false, Ordering::SeqCst);
        let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_request_order() {
        let factory = FakeFactory::new();
        let pool = Arc::new(pool_with(factory.clone(), 1, 5000));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let held = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();

        let mut tasks = Vec::new();
        for name in ["first", "second", "third"] {
            let pool = pool.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
                order.lock().unwrap().push(name);
                pool.release(lease).await;
            }));
            // Give each waiter time to join the queue before the next.
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        pool.release(held).await;
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_usage_tracks_memory_and_scope() {
        let factory = FakeFactory::new();
        let pool = pool_with(factory.clone(), 2, 1000);

        let a = pool.acquire("acme", EngineVariant::Chrome).await.unwrap();
        let b = pool.acquire("globex", EngineVariant::Edge).await.unwrap();

        let all = pool.usage(None).await;
        assert_eq!(all.session_count, 2);
        assert_eq!(all.memory_estimate_bytes, 2 * 256 * 1024 * 1024);

        let scoped = pool.usage(Some("acme")).await;
        assert_eq!(scoped.session_count, 1);

        pool.release(a).await;
        pool.release(b).await;
    }
}
