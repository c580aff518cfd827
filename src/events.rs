// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Zone timer events: REFRESH, RETRY, EXPIRE, flush, and resign

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::error::{ZoneErrorKind, ZoneResult};
use crate::serial::SerialNumber;
use crate::sign::Signer;
use crate::xfer::{transfer_to_use, TaskType, TransferState, TransferTask, XfrQueue};
use crate::zone::{FlushOutcome, Zone, ZoneState};

/// Maximum percentage a timer interval is shortened by to spread events out
pub const JITTER_PCT: u32 = 10;

/// Apply jitter to a time interval.
///
/// The interval is reduced by a uniformly random percentage up to
/// [`JITTER_PCT`].
pub fn jitter(interval: Duration) -> Duration {
    let millis = interval.as_millis() as u64;
    let pct = u64::from(rand::thread_rng().gen_range(0..JITTER_PCT));
    Duration::from_millis(millis * (100 - pct) / 100)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Handle of an armed timer. Cancellation is idempotent and only prevents
/// events that have not started yet.
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Prevents the timer from firing, if it hasn't already
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Arms a timer that runs `event` after `delay`.
///
/// The event runs on its own task, so cancelling the returned handle can
/// never abort an event that already started.
pub fn schedule(delay: Duration, event: BoxFuture<'static, ()>) -> TimerHandle {
    let handle = tokio::spawn(async move {
        sleep(delay).await;
        tokio::spawn(event);
    });

    TimerHandle { handle }
}

/// Everything the timer events need to do their work: the registry, the
/// transfer queue, and the signer. Passed around rather than kept as global
/// state.
pub struct EventCtx {
    /// The zone registry
    pub catalog: Catalog,
    /// Queue of the transfer subsystem
    pub xfr: Arc<dyn XfrQueue>,
    /// The DNSSEC signer
    pub signer: Arc<dyn Signer>,
}

/// (Re)arms the REFRESH timer for the zone and resets the transfer state.
///
/// With no explicit `delay`, a zone with contents refreshes at its jittered
/// SOA REFRESH interval and a stub retries bootstrapping.
pub async fn schedule_refresh(ctx: &Arc<EventCtx>, zone: &Arc<Zone>, delay: Option<Duration>) {
    let mut state = zone.state.lock().await;

    state.timers.cancel_refresh();
    state.timers.cancel_expire();
    state.xfr = TransferState::Idle;

    if zone.config().master.is_none() {
        return;
    }

    let delay = delay.unwrap_or_else(|| match zone.contents() {
        Some(contents) => jitter(Duration::from_secs(
            contents.soa_refresh().unwrap_or(0).into(),
        )),
        None => Duration::from_secs(zone.config().bootstrap_retry),
    });

    debug!("REFRESH '{}' set to {:?}", zone.name(), delay);
    state.timers.refresh = Some(schedule(
        delay,
        refresh_ev(Arc::clone(ctx), Arc::clone(zone)),
    ));
    state.xfr = TransferState::Scheduled;
}

/// Zone REFRESH or RETRY event.
///
/// A stub zone bootstraps with a full transfer; a populated zone arms EXPIRE
/// on its first attempt, reschedules itself as the RETRY timer, and probes
/// the master's SOA. Rescheduling always happens before the request is
/// enqueued so a slow transfer subsystem never delays the next fire.
pub fn refresh_ev(ctx: Arc<EventCtx>, zone: Arc<Zone>) -> BoxFuture<'static, ()> {
    Box::pin(refresh_ev_inner(ctx, zone))
}

async fn refresh_ev_inner(ctx: Arc<EventCtx>, zone: Arc<Zone>) {
    let master = match zone.config().master {
        Some(master) => master,
        None => return,
    };

    let contents = zone.contents();

    // bootstrap: nothing to probe yet, fetch the whole zone
    let Some(contents) = contents else {
        let mut state = zone.state.lock().await;
        if state.discarded {
            return;
        }

        if state.xfr == TransferState::Pending {
            // a bootstrap is already in flight
            return;
        }
        state.xfr = TransferState::Pending;

        // retry the bootstrap later in case the transfer fails silently
        state.timers.refresh = Some(schedule(
            Duration::from_secs(zone.config().bootstrap_retry),
            refresh_ev(Arc::clone(&ctx), Arc::clone(&zone)),
        ));

        let task = TransferTask {
            zone: zone.name().clone(),
            task: TaskType::Axfr,
            addr: master,
            tsig_key: zone.config().tsig_key.clone(),
            use_tcp: true,
            retries: 0,
        };
        if ctx.xfr.enqueue(task).is_err() {
            state.xfr = TransferState::Scheduled; // revert state
        }
        return;
    };

    let mut state = zone.state.lock().await;
    if state.discarded {
        return;
    }

    // schedule the EXPIRE timer on the first attempt, with slack for
    // connection timeouts so short expires don't fire before the probe can
    // even fail
    if state.timers.expire.is_none() {
        let expire_tmr = jitter(Duration::from_secs(contents.soa_expire().unwrap_or(0).into()))
            + Duration::from_secs(2 * zone.config().max_conn_idle);
        state.timers.expire = Some(schedule(
            expire_tmr,
            Box::pin(expire_ev(Arc::clone(&ctx), Arc::clone(&zone))),
        ));
        debug!(
            "EXPIRE of '{}' after {} seconds",
            zone.name(),
            expire_tmr.as_secs()
        );
    }

    // reschedule as the RETRY timer
    let retry_tmr = jitter(Duration::from_secs(contents.soa_retry().unwrap_or(0).into()));
    state.timers.refresh = Some(schedule(
        retry_tmr,
        refresh_ev(Arc::clone(&ctx), Arc::clone(&zone)),
    ));
    debug!(
        "RETRY of '{}' after {} seconds",
        zone.name(),
        retry_tmr.as_secs()
    );
    drop(state);

    // issue the probe
    let task = TransferTask {
        zone: zone.name().clone(),
        task: TaskType::SoaProbe,
        addr: master,
        tsig_key: zone.config().tsig_key.clone(),
        use_tcp: true,
        retries: 0,
    };
    if let Err(e) = ctx.xfr.enqueue(task) {
        warn!("failed to enqueue SOA probe for '{}': {e}", zone.name());
    }
}

/// Zone EXPIRE event: the master was unreachable for the whole SOA EXPIRE
/// interval, the zone's contents may no longer be served.
pub async fn expire_ev(ctx: Arc<EventCtx>, zone: Arc<Zone>) {
    let mut state = zone.state.lock().await;
    if state.discarded {
        return;
    }

    // unpublish; readers that captured the tree before this finish on it
    let expired = ctx
        .catalog
        .expire_zone(zone.name())
        .or_else(|| zone.take_contents());

    info!("Zone '{}' expired.", zone.name());

    state.timers.cancel_refresh();
    state.timers.expire = None;
    state.xfr = TransferState::Idle;

    drop(state);
    drop(expired);
}

/// (Re)arms the journal-to-zonefile sync timer
pub async fn schedule_flush(ctx: &Arc<EventCtx>, zone: &Arc<Zone>, delay: Duration) {
    let mut state = zone.state.lock().await;
    if state.discarded {
        return;
    }

    state.timers.cancel_flush();
    state.timers.flush = Some(schedule(
        delay,
        flush_ev(Arc::clone(ctx), Arc::clone(zone)),
    ));
}

/// Journal sync event: writes unsynced differences to the text zonefile and
/// reschedules itself at the configured interval
pub fn flush_ev(ctx: Arc<EventCtx>, zone: Arc<Zone>) -> BoxFuture<'static, ()> {
    Box::pin(flush_ev_inner(ctx, zone))
}

async fn flush_ev_inner(ctx: Arc<EventCtx>, zone: Arc<Zone>) {
    if zone.is_discarded().await {
        return;
    }

    // only zones with contents have anything to sync
    if zone.contents().is_some() {
        match zone.flush_to_zonefile().await {
            Ok(FlushOutcome::Synced(_)) => {
                info!("Applied differences of '{}' to zonefile.", zone.name());
            }
            Ok(FlushOutcome::UpToDate) => {}
            Err(e) => {
                warn!(
                    "Failed to apply differences of '{}' to zonefile ({}).",
                    zone.name(),
                    e
                );
            }
        }
    }

    let next_timeout = zone.config().dbsync_timeout;
    if next_timeout > 0 {
        debug!(
            "next zonefile sync of '{}' in {} seconds",
            zone.name(),
            next_timeout
        );

        let mut state = zone.state.lock().await;
        if state.discarded {
            return;
        }
        state.timers.flush = Some(schedule(
            Duration::from_secs(next_timeout),
            flush_ev(Arc::clone(&ctx), Arc::clone(&zone)),
        ));
    }
}

/// Arms the resign timer at the wall-clock second the signer asked for
pub async fn schedule_dnssec(ctx: &Arc<EventCtx>, zone: &Arc<Zone>, unixtime: u64) {
    let mut state = zone.state.lock().await;
    if state.discarded {
        return;
    }

    state.timers.cancel_dnssec();
    arm_dnssec(ctx, zone, &mut state, unixtime);
}

/// Cancels a pending resign. Idempotent.
pub async fn cancel_dnssec(zone: &Arc<Zone>) {
    zone.state.lock().await.timers.cancel_dnssec();
}

fn arm_dnssec(ctx: &Arc<EventCtx>, zone: &Arc<Zone>, state: &mut ZoneState, unixtime: u64) {
    let now = now_unix();
    let relative = if unixtime <= now {
        warn!(
            "DNSSEC: Zone {}: Signature life time too low, set higher value in configuration!",
            zone.name()
        );
        0
    } else {
        unixtime - now
    };

    info!(
        "DNSSEC: Zone {}: Next signing planned in {} seconds.",
        zone.name(),
        relative
    );

    state.timers.dnssec = Some(schedule(
        Duration::from_secs(relative),
        Box::pin(dnssec_ev(Arc::clone(ctx), Arc::clone(zone))),
    ));
    state.timers.dnssec_refresh_at = Some(unixtime);
}

/// Moves an armed resign earlier when a dynamic update produced signatures
/// that need refreshing before the current plan
pub(crate) fn replan_dnssec_after_update(
    ctx: &Arc<EventCtx>,
    zone: &Arc<Zone>,
    state: &mut ZoneState,
    refresh_at: u64,
) {
    if refresh_at == 0 {
        return;
    }

    match state.timers.dnssec_refresh_at {
        Some(current) if current <= refresh_at => {}
        _ => {
            state.timers.cancel_dnssec();
            arm_dnssec(ctx, zone, state, refresh_at);
        }
    }
}

/// Resign event: signs the zone and reschedules itself at the refresh time
/// the signer returns
pub async fn dnssec_ev(ctx: Arc<EventCtx>, zone: Arc<Zone>) {
    if zone.is_discarded().await {
        return;
    }

    match crate::update::sign_zone_now(&ctx, &zone, false).await {
        Ok(refresh_at) if refresh_at != 0 => {
            schedule_dnssec(&ctx, &zone, refresh_at).await;
        }
        Ok(_) => {}
        Err(e) => {
            error!("DNSSEC: Zone {} - Failed to sign zone ({}).", zone.name(), e);
        }
    }
}

/// Handles the result of a SOA probe against the master.
///
/// When the master is ahead, a transfer (incremental if the zone keeps a
/// journal) is enqueued, guarded so at most one transfer is in flight per
/// zone. When the zone is current, the regular REFRESH interval is restored.
/// Returns true when a transfer was started.
pub async fn process_soa_response(
    ctx: &Arc<EventCtx>,
    zone: &Arc<Zone>,
    master_serial: u32,
) -> ZoneResult<bool> {
    let contents = zone
        .contents()
        .ok_or(ZoneErrorKind::InvalidArgument("zone has no contents"))?;
    let local_serial = contents.serial();

    if !(SerialNumber(local_serial) < SerialNumber(master_serial)) {
        // no updates available
        schedule_refresh(ctx, zone, None).await;
        return Ok(false);
    }

    let master = zone
        .config()
        .master
        .ok_or(ZoneErrorKind::InvalidArgument("zone has no master"))?;

    let mut state = zone.state.lock().await;
    if state.discarded {
        return Ok(false);
    }
    if state.xfr == TransferState::Pending {
        // already pending
        return Ok(false);
    }
    state.xfr = TransferState::Pending;

    let task = TransferTask {
        zone: zone.name().clone(),
        task: transfer_to_use(zone).await,
        addr: master,
        tsig_key: zone.config().tsig_key.clone(),
        use_tcp: true,
        retries: 0,
    };

    if ctx.xfr.enqueue(task).is_err() {
        state.xfr = TransferState::Scheduled; // revert state
        return Err(ZoneErrorKind::Busy.into());
    }

    Ok(true)
}

/// Called by the transfer subsystem when a transfer for the zone completed,
/// successfully or not; the zone goes back to its regular refresh schedule
pub async fn transfer_finished(ctx: &Arc<EventCtx>, zone: &Arc<Zone>) {
    schedule_refresh(ctx, zone, None).await;
}
