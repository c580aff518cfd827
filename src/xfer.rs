// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks handed to the zone transfer subsystem

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::error;

use crate::error::{ZoneError, ZoneErrorKind, ZoneResult};
use crate::proto::rr::LowerName;
use crate::zone::Zone;

/// The state of inbound transfers for a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    /// No transfer activity
    #[default]
    Idle,
    /// A refresh is scheduled on a timer
    Scheduled,
    /// A transfer request is enqueued or in flight
    Pending,
}

/// The kind of work a transfer task requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// Probe the master's SOA serial over TCP
    SoaProbe,
    /// Full zone transfer
    Axfr,
    /// Incremental zone transfer
    Ixfr,
    /// Wake up a secondary
    Notify,
    /// Forward a dynamic update towards the primary
    UpdateForward,
}

/// A unit of work for the transfer subsystem
#[derive(Debug, Clone)]
pub struct TransferTask {
    /// Zone the task belongs to
    pub zone: LowerName,
    /// What to do
    pub task: TaskType,
    /// The remote to talk to
    pub addr: SocketAddr,
    /// TSIG key name to sign the exchange with
    pub tsig_key: Option<String>,
    /// Whether the exchange must run over TCP
    pub use_tcp: bool,
    /// Retries before the task is dropped, used by NOTIFY
    pub retries: u32,
}

/// The transfer subsystem as seen by the zone core: a queue of tasks.
///
/// The core only constructs and enqueues tasks; transport, retries, and the
/// actual DNS exchanges are the queue implementation's business.
pub trait XfrQueue: Send + Sync {
    /// Hands a task to the transfer workers
    fn enqueue(&self, task: TransferTask) -> ZoneResult<()>;
}

/// An [`XfrQueue`] backed by an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<TransferTask>,
}

impl ChannelQueue {
    /// Creates the queue and the receiving end for the transfer workers
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl XfrQueue for ChannelQueue {
    fn enqueue(&self, task: TransferTask) -> ZoneResult<()> {
        self.sender.send(task).map_err(|_| {
            error!("transfer queue is gone");
            ZoneError::from(ZoneErrorKind::Busy)
        })
    }
}

/// Chooses the inbound transfer type for a zone: incremental when the zone
/// keeps a journal, full otherwise
pub async fn transfer_to_use(zone: &Zone) -> TaskType {
    if zone.has_journal().await {
        TaskType::Ixfr
    } else {
        TaskType::Axfr
    }
}

/// Builds the NOTIFY tasks for every configured remote of the zone.
///
/// Zones without contents are stubs and notify nobody.
pub fn notify_tasks(zone: &Zone) -> Vec<TransferTask> {
    if zone.contents().is_none() {
        return Vec::new();
    }

    let config = zone.config();
    config
        .notify
        .iter()
        .map(|remote| TransferTask {
            zone: zone.name().clone(),
            task: TaskType::Notify,
            addr: remote.addr,
            tsig_key: remote.tsig_key.clone(),
            use_tcp: false,
            retries: config.notify_retries,
        })
        .collect()
}

/// Enqueues a NOTIFY to every configured remote, logging enqueue failures
/// per remote rather than aborting
pub fn schedule_notify(zone: &Zone, queue: &dyn XfrQueue) {
    for task in notify_tasks(zone) {
        if queue.enqueue(task).is_err() {
            error!("Failed to enqueue NOTIFY for '{}'.", zone.name());
        }
    }
}
