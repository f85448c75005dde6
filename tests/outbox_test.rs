use adbook::catalog::{self, ShowDraft};
use adbook::clock::{Clock, ManualClock};
use adbook::contract::DocumentService;
use adbook::db;
use adbook::lifecycle::{BookingPolicy, Lifecycle, SubmitRequest};
use adbook::model::{Actor, ApplicationStatus, Role};
use adbook::notify::{Notification, NotificationHub, NotificationSink, Recipient};
use adbook::outbox::{process_next_task, Dispatch, FanOut, RetryPolicy};
use adbook::profile::SqlProfiles;
use adbook::schedule::{self, BroadcastDraft};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use std::sync::Arc;
use tokio::sync::Mutex;

const CUSTOMER: Actor = Actor {
    user_id: 10,
    role: Role::Customer,
};
const AGENT: Actor = Actor {
    user_id: 20,
    role: Role::Agent,
};
const COMMERCIAL: Actor = Actor {
    user_id: 30,
    role: Role::Commercial,
};

const RETRY: RetryPolicy = RetryPolicy {
    max_backoff_secs: 60,
    max_attempts: 0,
};

#[derive(Clone, Default)]
struct RecordingSink {
    delivered: Arc<Mutex<Vec<Notification>>>,
    failures_left: Arc<Mutex<usize>>,
}

impl RecordingSink {
    fn failing(times: usize) -> Self {
        Self {
            failures_left: Arc::new(Mutex::new(times)),
            ..Default::default()
        }
    }

    async fn for_recipient(&self, r: Recipient) -> Vec<Notification> {
        self.delivered
            .lock()
            .await
            .iter()
            .filter(|n| n.recipient() == r)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let mut left = self.failures_left.lock().await;
        if *left > 0 {
            *left -= 1;
            return Err(anyhow!("socket closed"));
        }
        self.delivered.lock().await.push(notification.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingDocuments {
    calls: Arc<Mutex<Vec<(i64, ApplicationStatus)>>>,
}

#[async_trait]
impl DocumentService for RecordingDocuments {
    async fn application_finalized(&self, application_id: i64, status: ApplicationStatus) -> Result<()> {
        self.calls.lock().await.push((application_id, status));
        Ok(())
    }
}

async fn setup() -> (Lifecycle, Arc<ManualClock>, i64) {
    let pool = db::memory_pool().await.unwrap();
    let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
    let clock = Arc::new(ManualClock::new(date.and_hms_opt(6, 0, 0).unwrap().and_utc()));
    let admin = Actor::new(1, Role::Admin);
    let show = catalog::create_show(
        &pool,
        admin,
        ShowDraft {
            name: "Morning News".into(),
            category: "news".into(),
            window: "09:00-10:00".into(),
            recurrence: "daily".into(),
            price_per_minute_cents: 60_000,
        },
    )
    .await
    .unwrap();
    let broadcast = schedule::create_broadcast(
        &pool,
        admin,
        BroadcastDraft {
            show_id: show.id,
            air_date: date,
            duration_minutes: None,
            ad_minutes: 6,
            capacity: 2,
        },
        clock.now(),
    )
    .await
    .unwrap();
    let profiles = SqlProfiles::new(pool.clone());
    profiles.register_payout_details(CUSTOMER.user_id).await.unwrap();
    let life = Lifecycle::new(pool, Arc::new(profiles), BookingPolicy::default())
        .with_clock(clock.clone());
    (life, clock, broadcast.id)
}

fn request(broadcast_id: i64) -> SubmitRequest {
    SubmitRequest {
        broadcast_id,
        duration_secs: 15,
        contact_phone: "5550100".into(),
        description: "Bakery opening".into(),
    }
}

async fn drain(life: &Lifecycle, to: &Dispatch<'_>) -> usize {
    let mut n = 0;
    while process_next_task(life.pool(), to, RETRY).await.unwrap() {
        n += 1;
    }
    n
}

#[tokio::test]
async fn approval_fans_out_in_commit_order() {
    let (life, clock, broadcast_id) = setup().await;
    let sink = RecordingSink::default();
    let docs = RecordingDocuments::default();
    let to = Dispatch {
        notifications: &sink,
        documents: &docs,
        clock: &*clock,
    };

    let app = life.submit(CUSTOMER, request(broadcast_id)).await.unwrap();
    life.claim(AGENT, app.id).await.unwrap();
    life.hand_off(AGENT, app.id).await.unwrap();
    life.approve(COMMERCIAL, app.id).await.unwrap();
    assert!(drain(&life, &to).await > 0);
    assert_eq!(db::count_remaining_outbox_tasks(life.pool()).await.unwrap(), 0);

    let customer: Vec<_> = sink
        .for_recipient(Recipient::User(CUSTOMER.user_id))
        .await
        .into_iter()
        .map(|n| n.new_status)
        .collect();
    assert_eq!(
        customer,
        vec![
            Some(ApplicationStatus::InProgress),
            Some(ApplicationStatus::SentToCommercial),
            Some(ApplicationStatus::Approved),
        ]
    );

    let desk = sink.for_recipient(Recipient::Desk(Role::Agent)).await;
    assert_eq!(desk.len(), 1);
    assert_eq!(desk[0].new_status, Some(ApplicationStatus::Pending));

    let commercial_desk = sink.for_recipient(Recipient::Desk(Role::Commercial)).await;
    assert_eq!(commercial_desk.len(), 1);
    assert!(sink.for_recipient(Recipient::User(COMMERCIAL.user_id)).await.is_empty());

    let agent = sink.for_recipient(Recipient::User(AGENT.user_id)).await;
    assert_eq!(agent.len(), 1);
    assert_eq!(agent[0].room.as_deref(), Some(format!("commercial-agent-20-app-{}", app.id).as_str()));

    assert_eq!(
        *docs.calls.lock().await,
        vec![(app.id, ApplicationStatus::Approved)]
    );
}

#[tokio::test]
async fn failed_delivery_backs_off_and_keeps_order() {
    let (life, clock, broadcast_id) = setup().await;
    let sink = RecordingSink::failing(2);
    let docs = RecordingDocuments::default();
    let to = Dispatch {
        notifications: &sink,
        documents: &docs,
        clock: &*clock,
    };

    let app = life.submit(CUSTOMER, request(broadcast_id)).await.unwrap();
    life.claim(AGENT, app.id).await.unwrap();

    // First attempt fails; the head task is not due again for 5s and the
    // claim notification queued behind it must wait too.
    assert!(process_next_task(life.pool(), &to, RETRY).await.unwrap());
    assert!(!process_next_task(life.pool(), &to, RETRY).await.unwrap());

    clock.advance(Duration::seconds(5));
    assert!(process_next_task(life.pool(), &to, RETRY).await.unwrap());
    assert!(!process_next_task(life.pool(), &to, RETRY).await.unwrap());

    clock.advance(Duration::seconds(10));
    assert_eq!(drain(&life, &to).await, 2);

    let delivered: Vec<_> = sink
        .delivered
        .lock()
        .await
        .iter()
        .map(|n| n.new_status)
        .collect();
    assert_eq!(
        delivered,
        vec![
            Some(ApplicationStatus::Pending),
            Some(ApplicationStatus::InProgress)
        ]
    );
}

#[tokio::test]
async fn undeliverable_tasks_are_dropped_after_max_attempts() {
    let (life, clock, broadcast_id) = setup().await;
    let sink = RecordingSink::failing(usize::MAX);
    let docs = RecordingDocuments::default();
    let to = Dispatch {
        notifications: &sink,
        documents: &docs,
        clock: &*clock,
    };
    let retry = RetryPolicy {
        max_backoff_secs: 60,
        max_attempts: 2,
    };

    life.submit(CUSTOMER, request(broadcast_id)).await.unwrap();
    assert_eq!(db::count_remaining_outbox_tasks(life.pool()).await.unwrap(), 1);

    assert!(process_next_task(life.pool(), &to, retry).await.unwrap());
    assert_eq!(db::count_remaining_outbox_tasks(life.pool()).await.unwrap(), 1);
    clock.advance(Duration::seconds(60));
    assert!(process_next_task(life.pool(), &to, retry).await.unwrap());
    assert_eq!(db::count_remaining_outbox_tasks(life.pool()).await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_reaches_live_subscribers() {
    let (life, clock, broadcast_id) = setup().await;
    let hub = Arc::new(NotificationHub::default());
    let mut agent_rx = hub.subscribe(Recipient::User(AGENT.user_id)).await;
    let mut desk_rx = hub.subscribe(Recipient::Desk(Role::Agent)).await;

    let sinks: Vec<Box<dyn NotificationSink>> =
        vec![Box::new(Arc::clone(&hub)), Box::new(RecordingSink::default())];
    let sink = FanOut::new(sinks);
    let docs = RecordingDocuments::default();
    let to = Dispatch {
        notifications: &sink,
        documents: &docs,
        clock: &*clock,
    };

    let app = life.submit(CUSTOMER, request(broadcast_id)).await.unwrap();
    life.claim(AGENT, app.id).await.unwrap();
    life.cancel(CUSTOMER, app.id).await.unwrap();
    drain(&life, &to).await;

    let submitted = desk_rx.recv().await.unwrap();
    assert_eq!(submitted.application_id, app.id);
    assert_eq!(submitted.new_status, Some(ApplicationStatus::Pending));

    let cancelled = agent_rx.recv().await.unwrap();
    assert_eq!(cancelled.application_id, app.id);
    assert_eq!(cancelled.new_status, None);
    assert_eq!(cancelled.message, format!("Application #{} was cancelled by the customer", app.id));
}
