use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use hickory_zone::config::{RemoteConfig, ZoneConfig};
use hickory_zone::content::ZoneContents;
use hickory_zone::events::{
    self, expire_ev, process_soa_response, refresh_ev, schedule_refresh, EventCtx,
};
use hickory_zone::journal::Journal;
use hickory_zone::proto::rr::rdata::SOA;
use hickory_zone::proto::rr::{LowerName, Name, RData, Record, RecordSet, RecordType, RrKey};
use hickory_zone::sign::NullSigner;
use hickory_zone::xfer::{notify_tasks, ChannelQueue, TaskType, TransferState, TransferTask};
use hickory_zone::{Catalog, Zone};

fn test_dir(test_name: &str) -> PathBuf {
    let dir = PathBuf::from("target/tests")
        .join("zone_events")
        .join(test_name);
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn soa_record(serial: u32) -> Record {
    let origin = Name::from_str("example.com.").unwrap();
    Record::from_rdata(
        origin,
        3600,
        RData::SOA(SOA::new(
            Name::from_str("ns1.example.com.").unwrap(),
            Name::from_str("admin.example.com.").unwrap(),
            serial,
            7200,
            1800,
            1_209_600,
            300,
        )),
    )
}

fn contents(serial: u32) -> ZoneContents {
    let origin = Name::from_str("example.com.").unwrap();
    let mut records = BTreeMap::new();

    let mut soa = RecordSet::new(&origin, RecordType::SOA, 0);
    soa.insert(soa_record(serial), 0);
    records.insert(RrKey::new(LowerName::from(&origin), RecordType::SOA), soa);

    let www = Name::from_str("www.example.com.").unwrap();
    let mut a = RecordSet::new(&www, RecordType::A, 0);
    a.insert(
        Record::from_rdata(
            www.clone(),
            300,
            RData::A(Ipv4Addr::new(192, 0, 2, 1).into()),
        ),
        0,
    );
    records.insert(RrKey::new(LowerName::from(&www), RecordType::A), a);

    ZoneContents::new(origin, records).unwrap()
}

fn secondary_config(dir: &std::path::Path) -> ZoneConfig {
    ZoneConfig {
        master: Some("192.0.2.1:53".parse().unwrap()),
        tsig_key: Some("xfr-key".to_string()),
        bootstrap_retry: 3600,
        dbsync_timeout: 3600,
        ..ZoneConfig::primary(dir.join("example.com.zone"))
    }
}

struct Fixture {
    ctx: Arc<EventCtx>,
    zone: Arc<Zone>,
    receiver: tokio::sync::mpsc::UnboundedReceiver<TransferTask>,
}

fn fixture(dir: &std::path::Path) -> Fixture {
    let (queue, receiver) = ChannelQueue::new();
    let catalog = Catalog::new();
    let zone = Arc::new(Zone::new(
        Name::from_str("example.com.").unwrap(),
        secondary_config(dir),
    ));
    catalog.upsert(Arc::clone(&zone));

    let ctx = Arc::new(EventCtx {
        catalog,
        xfr: Arc::new(queue),
        signer: Arc::new(NullSigner),
    });

    Fixture {
        ctx,
        zone,
        receiver,
    }
}

async fn recv_task(
    receiver: &mut tokio::sync::mpsc::UnboundedReceiver<TransferTask>,
) -> TransferTask {
    timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("no transfer task was enqueued")
        .expect("transfer queue closed")
}

#[tokio::test]
async fn test_bootstrap_refresh_enqueues_axfr() {
    let dir = test_dir("bootstrap");
    let mut fixture = fixture(&dir);

    // the zone is a stub; the refresh timer fires immediately
    schedule_refresh(&fixture.ctx, &fixture.zone, Some(Duration::ZERO)).await;

    let task = recv_task(&mut fixture.receiver).await;
    assert_eq!(task.task, TaskType::Axfr);
    assert!(task.use_tcp);
    assert_eq!(task.tsig_key.as_deref(), Some("xfr-key"));
    assert_eq!(task.zone, *fixture.zone.name());

    // bootstrapping zones do not arm EXPIRE, and the transfer is pending
    assert!(!fixture.zone.expire_armed().await);
    assert_eq!(fixture.zone.transfer_state().await, TransferState::Pending);
    assert_eq!(fixture.zone.zonefile_serial().await, 0);
}

#[tokio::test]
async fn test_refresh_probes_soa_and_arms_expire() {
    let dir = test_dir("refresh_probe");
    let mut fixture = fixture(&dir);
    fixture.zone.publish(Some(Arc::new(contents(100))));

    refresh_ev(Arc::clone(&fixture.ctx), Arc::clone(&fixture.zone)).await;

    let task = recv_task(&mut fixture.receiver).await;
    assert_eq!(task.task, TaskType::SoaProbe);
    assert!(task.use_tcp);

    // the first attempt arms EXPIRE with slack for connection timeouts
    assert!(fixture.zone.expire_armed().await);
}

#[tokio::test]
async fn test_soa_response_up_to_date_reschedules() {
    let dir = test_dir("soa_up_to_date");
    let fixture = fixture(&dir);
    fixture.zone.publish(Some(Arc::new(contents(100))));

    let started = process_soa_response(&fixture.ctx, &fixture.zone, 100)
        .await
        .unwrap();
    assert!(!started);
    assert_eq!(
        fixture.zone.transfer_state().await,
        TransferState::Scheduled
    );
}

#[tokio::test]
async fn test_soa_response_behind_starts_transfer() {
    let dir = test_dir("soa_behind");
    let mut fixture = fixture(&dir);
    fixture.zone.publish(Some(Arc::new(contents(100))));

    let started = process_soa_response(&fixture.ctx, &fixture.zone, 105)
        .await
        .unwrap();
    assert!(started);
    assert_eq!(fixture.zone.transfer_state().await, TransferState::Pending);

    // no journal: a full transfer is requested
    let task = recv_task(&mut fixture.receiver).await;
    assert_eq!(task.task, TaskType::Axfr);

    // a second response while pending is suppressed
    let started = process_soa_response(&fixture.ctx, &fixture.zone, 106)
        .await
        .unwrap();
    assert!(!started);
}

#[tokio::test]
async fn test_soa_response_prefers_ixfr_with_journal() {
    let dir = test_dir("soa_ixfr");
    let mut fixture = fixture(&dir);
    fixture.zone.publish(Some(Arc::new(contents(100))));
    fixture.zone.set_journal(Journal::in_memory().unwrap()).await;

    process_soa_response(&fixture.ctx, &fixture.zone, 105)
        .await
        .unwrap();

    let task = recv_task(&mut fixture.receiver).await;
    assert_eq!(task.task, TaskType::Ixfr);
}

#[tokio::test]
async fn test_expiry_race_with_pending_refresh() {
    let dir = test_dir("expiry_race");
    let mut fixture = fixture(&dir);
    fixture.zone.publish(Some(Arc::new(contents(100))));

    // a transfer is pending when EXPIRE fires
    process_soa_response(&fixture.ctx, &fixture.zone, 105)
        .await
        .unwrap();
    assert_eq!(fixture.zone.transfer_state().await, TransferState::Pending);
    let _pending_task = recv_task(&mut fixture.receiver).await;

    // a reader captured the contents before the expiry
    let captured = fixture.zone.contents().unwrap();

    expire_ev(Arc::clone(&fixture.ctx), Arc::clone(&fixture.zone)).await;

    // the zone is a stub now, new queries see nothing
    assert!(fixture.zone.contents().is_none());
    assert_eq!(fixture.zone.serial(), 0);
    assert_eq!(fixture.zone.transfer_state().await, TransferState::Idle);

    // the reader's capture still answers from the old tree
    assert_eq!(captured.serial(), 100);
    assert!(captured
        .lookup(
            &LowerName::from_str("www.example.com.").unwrap(),
            RecordType::A
        )
        .is_some());
}

#[tokio::test]
async fn test_discarded_zone_ignores_events() {
    let dir = test_dir("discarded");
    let mut fixture = fixture(&dir);
    fixture.zone.publish(Some(Arc::new(contents(100))));
    fixture.zone.discard().await;

    refresh_ev(Arc::clone(&fixture.ctx), Arc::clone(&fixture.zone)).await;
    assert!(
        timeout(Duration::from_millis(100), fixture.receiver.recv())
            .await
            .is_err(),
        "a discarded zone must not enqueue work"
    );

    expire_ev(Arc::clone(&fixture.ctx), Arc::clone(&fixture.zone)).await;
    // contents were not touched by the ignored expiry
    assert_eq!(fixture.zone.serial(), 100);
}

#[tokio::test]
async fn test_notify_tasks_for_remotes() {
    let dir = test_dir("notify");
    let mut config = secondary_config(&dir);
    config.notify = vec![RemoteConfig {
        addr: "198.51.100.2:53".parse().unwrap(),
        tsig_key: Some("notify-key".to_string()),
    }];
    config.notify_retries = 2;
    let zone = Arc::new(Zone::new(Name::from_str("example.com.").unwrap(), config));

    // stub zones notify nobody
    assert!(notify_tasks(&zone).is_empty());

    zone.publish(Some(Arc::new(contents(100))));
    let tasks = notify_tasks(&zone);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task, TaskType::Notify);
    assert_eq!(tasks[0].addr, "198.51.100.2:53".parse().unwrap());
    assert_eq!(tasks[0].tsig_key.as_deref(), Some("notify-key"));
    assert_eq!(tasks[0].retries, 2);
    assert!(!tasks[0].use_tcp);
}

#[tokio::test]
async fn test_flush_event_syncs_and_catches_up() {
    let dir = test_dir("flush_event");
    let fixture = fixture(&dir);

    // zonefile at 100, journal carries 100 -> 101 -> 102
    fixture.zone.publish(Some(Arc::new(contents(100))));
    fixture.zone.set_zonefile_serial(100).await;

    let journal = Journal::in_memory().unwrap();
    for (from, to) in [(100u32, 101u32), (101, 102)] {
        let mut changeset = hickory_zone::Changeset::with_soa(soa_record(from), soa_record(to));
        let name = Name::from_str(&format!("host{to}.example.com.")).unwrap();
        let mut rrset = RecordSet::new(&name, RecordType::A, 0);
        rrset.insert(
            Record::from_rdata(
                name.clone(),
                300,
                RData::A(Ipv4Addr::new(192, 0, 2, (to & 0xff) as u8).into()),
            ),
            0,
        );
        changeset.push_add(rrset);
        journal.store_changeset(&changeset).unwrap();
    }
    fixture.zone.set_journal(journal).await;

    // startup catch-up replays the journal
    let reached = fixture.zone.journal_apply().await.unwrap();
    assert_eq!(reached, Some(102));

    // the flush event writes the zonefile and clears the dirty entries
    events::flush_ev(Arc::clone(&fixture.ctx), Arc::clone(&fixture.zone)).await;
    assert_eq!(fixture.zone.zonefile_serial().await, 102);
    assert!(dir.join("example.com.zone").exists());

    let journal = fixture.zone.journal().await;
    let mut dirty = 0;
    journal
        .as_ref()
        .unwrap()
        .walk(|entry| {
            if entry.is_dirty() {
                dirty += 1;
            }
        })
        .unwrap();
    assert_eq!(dirty, 0);
}
