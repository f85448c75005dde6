use adbook::catalog::{self, ShowDraft};
use adbook::clock::{Clock, ManualClock};
use adbook::db;
use adbook::error::{BookingError, Conflict, Denied, Precondition};
use adbook::lifecycle::{ApplicationFilter, BookingPolicy, FieldEdit, Lifecycle, SubmitRequest};
use adbook::model::{Actor, ApplicationState, ApplicationStatus, ContractStatus, Role};
use adbook::profile::SqlProfiles;
use adbook::schedule::{self, BroadcastDraft};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;

const CUSTOMER: Actor = Actor {
    user_id: 10,
    role: Role::Customer,
};
const OTHER_CUSTOMER: Actor = Actor {
    user_id: 11,
    role: Role::Customer,
};
const AGENT: Actor = Actor {
    user_id: 20,
    role: Role::Agent,
};
const OTHER_AGENT: Actor = Actor {
    user_id: 21,
    role: Role::Agent,
};
const COMMERCIAL: Actor = Actor {
    user_id: 30,
    role: Role::Commercial,
};
const OTHER_COMMERCIAL: Actor = Actor {
    user_id: 31,
    role: Role::Commercial,
};
const ACCOUNTANT: Actor = Actor {
    user_id: 40,
    role: Role::Accountant,
};
const ADMIN: Actor = Actor {
    user_id: 1,
    role: Role::Admin,
};

// 2030-01-07 is a Monday.
fn air_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
}

fn morning() -> DateTime<Utc> {
    air_date().and_hms_opt(6, 0, 0).unwrap().and_utc()
}

struct Fixture {
    life: Lifecycle,
    clock: Arc<ManualClock>,
    broadcast_id: i64,
}

async fn fixture(capacity: i64) -> Fixture {
    let pool = db::memory_pool().await.unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let show = catalog::create_show(
        &pool,
        ADMIN,
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
        ADMIN,
        BroadcastDraft {
            show_id: show.id,
            air_date: air_date(),
            duration_minutes: None,
            ad_minutes: 6,
            capacity,
        },
        clock.now(),
    )
    .await
    .unwrap();
    let profiles = SqlProfiles::new(pool.clone());
    profiles.register_payout_details(CUSTOMER.user_id).await.unwrap();
    let life = Lifecycle::new(pool, Arc::new(profiles), BookingPolicy::default())
        .with_clock(clock.clone());
    Fixture {
        life,
        clock,
        broadcast_id: broadcast.id,
    }
}

fn request(broadcast_id: i64) -> SubmitRequest {
    SubmitRequest {
        broadcast_id,
        duration_secs: 30,
        contact_phone: "+1 555 0100".into(),
        description: "Spring sale spot".into(),
    }
}

async fn handed_off(f: &Fixture) -> i64 {
    let app = f.life.submit(CUSTOMER, request(f.broadcast_id)).await.unwrap();
    f.life.claim(AGENT, app.id).await.unwrap();
    f.life.hand_off(AGENT, app.id).await.unwrap();
    app.id
}

async fn booked(f: &Fixture) -> i64 {
    schedule::get_broadcast(f.life.pool(), f.broadcast_id)
        .await
        .unwrap()
        .booked_slots
}

#[tokio::test]
async fn full_booking_flow() {
    let f = fixture(3).await;

    let app = f.life.submit(CUSTOMER, request(f.broadcast_id)).await.unwrap();
    assert_eq!(app.state, ApplicationState::Pending);
    assert_eq!(app.cost_cents, 30_000);
    assert_eq!(app.contact_phone, "+1 555 0100");

    let pool_view = f.life.list(AGENT, &ApplicationFilter::default()).await.unwrap();
    assert_eq!(pool_view.len(), 1);
    assert_eq!(pool_view[0].show_name, "Morning News");

    let claimed = f.life.claim(AGENT, app.id).await.unwrap();
    assert_eq!(claimed.state, ApplicationState::InProgress { agent_id: 20 });

    let err = f.life.claim(OTHER_AGENT, app.id).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Conflict(Conflict::AlreadyClaimed { holder: 20, .. })
    ));
    assert!(f
        .life
        .list(OTHER_AGENT, &ApplicationFilter::default())
        .await
        .unwrap()
        .is_empty());

    let err = f.life.hand_off(OTHER_AGENT, app.id).await.unwrap_err();
    assert!(matches!(err, BookingError::Authorization(Denied::NotOwner { .. })));
    f.life.hand_off(AGENT, app.id).await.unwrap();

    let queue = f
        .life
        .commercial_queue(COMMERCIAL, &ApplicationFilter::default())
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].status, ApplicationStatus::SentToCommercial);

    // Approving an unowned hand-off claims it implicitly.
    let approved = f.life.approve(COMMERCIAL, app.id).await.unwrap();
    match approved.state {
        ApplicationState::Approved {
            agent_id,
            commercial_id,
            approved_at,
            due_at,
        } => {
            assert_eq!(agent_id, 20);
            assert_eq!(commercial_id, 30);
            assert_eq!(approved_at, morning());
            assert_eq!(due_at, morning() + Duration::days(14));
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(booked(&f).await, 1);

    let contract = f.life.contract_for(CUSTOMER, app.id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Sent);
    let err = f
        .life
        .advance_contract(AGENT, contract.id, ContractStatus::Viewed)
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Authorization(_)));
    let downloaded = f
        .life
        .advance_contract(CUSTOMER, contract.id, ContractStatus::Downloaded)
        .await
        .unwrap();
    assert_eq!(downloaded.status, ContractStatus::Downloaded);
    assert!(downloaded.viewed_at.is_some());
    assert!(downloaded.downloaded_at.is_some());
    let err = f
        .life
        .advance_contract(CUSTOMER, contract.id, ContractStatus::Viewed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::Conflict(Conflict::ContractRegression {
            current: ContractStatus::Downloaded,
            ..
        })
    ));

    f.clock.advance(Duration::days(3));
    let paid = f.life.mark_paid(ACCOUNTANT, app.id).await.unwrap();
    assert_eq!(paid.state.status(), ApplicationStatus::Paid);

    let view = f.life.get(CUSTOMER, app.id).await.unwrap();
    assert_eq!(view.status, ApplicationStatus::Paid);
    assert_eq!(view.application.version, 5);
    let err = f.life.get(OTHER_CUSTOMER, app.id).await.unwrap_err();
    assert!(matches!(err, BookingError::Authorization(_)));
}

#[tokio::test]
async fn approvals_are_bounded_by_capacity() {
    let f = fixture(1).await;
    let first = handed_off(&f).await;
    let second = handed_off(&f).await;

    f.life.approve(COMMERCIAL, first).await.unwrap();
    let err = f.life.approve(OTHER_COMMERCIAL, second).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Precondition(Precondition::CapacityExceeded {
            capacity: 1,
            booked: 1,
            ..
        })
    ));
    assert_eq!(booked(&f).await, 1);

    // The failed approval left no trace.
    let view = f.life.get(ADMIN, second).await.unwrap();
    assert_eq!(
        view.application.state,
        ApplicationState::SentToCommercial {
            agent_id: 20,
            commercial_id: None
        }
    );
    assert!(matches!(
        f.life.contract_for(ADMIN, second).await.unwrap_err(),
        BookingError::NotFound { .. }
    ));

    let err = f.life.submit(CUSTOMER, request(f.broadcast_id)).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Precondition(Precondition::SlotUnavailable { .. })
    ));

    f.life.reverse(COMMERCIAL, first).await.unwrap();
    assert_eq!(booked(&f).await, 0);
    let app = f.life.submit(CUSTOMER, request(f.broadcast_id)).await.unwrap();
    assert_eq!(app.state, ApplicationState::Pending);
}

#[tokio::test]
async fn reversal_gives_the_slot_back() {
    let f = fixture(2).await;
    let id = handed_off(&f).await;
    f.life.approve(COMMERCIAL, id).await.unwrap();
    assert_eq!(booked(&f).await, 1);

    let err = f.life.reverse(AGENT, id).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Authorization(Denied::RoleNotPermitted { .. })
    ));

    f.clock.advance(Duration::hours(1));
    let reversed = f.life.reverse(COMMERCIAL, id).await.unwrap();
    assert_eq!(
        reversed.state,
        ApplicationState::Rejected {
            agent_id: 20,
            commercial_id: 30,
            reversed_at: Some(morning() + Duration::hours(1)),
        }
    );
    assert_eq!(booked(&f).await, 0);

    let err = f.life.reverse(ADMIN, id).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Conflict(Conflict::StateMismatch {
            actual: ApplicationStatus::Rejected,
            ..
        })
    ));
    assert_eq!(booked(&f).await, 0);
}

#[tokio::test]
async fn overdue_is_derived_from_the_due_date() {
    let f = fixture(2).await;
    let id = handed_off(&f).await;
    f.life.approve(COMMERCIAL, id).await.unwrap();

    let overdue = ApplicationFilter {
        status: Some(ApplicationStatus::Overdue),
        ..Default::default()
    };
    let approved = ApplicationFilter {
        status: Some(ApplicationStatus::Approved),
        ..Default::default()
    };
    assert!(f.life.list(ACCOUNTANT, &overdue).await.unwrap().is_empty());
    assert_eq!(f.life.list(ACCOUNTANT, &approved).await.unwrap().len(), 1);

    f.clock.advance(Duration::days(15));
    let listed = f.life.list(ACCOUNTANT, &overdue).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, ApplicationStatus::Overdue);
    assert!(f.life.list(ACCOUNTANT, &approved).await.unwrap().is_empty());

    // Payment still clears an overdue application.
    let paid = f.life.mark_paid(ADMIN, id).await.unwrap();
    assert_eq!(paid.state.effective_status(f.clock.now()), ApplicationStatus::Paid);
}

#[tokio::test]
async fn commercial_queue_never_shows_rejections() {
    let f = fixture(2).await;
    let rejected = handed_off(&f).await;
    let open = handed_off(&f).await;
    f.life.commercial_claim(COMMERCIAL, rejected).await.unwrap();

    let err = f.life.reject(OTHER_COMMERCIAL, rejected).await.unwrap_err();
    assert!(matches!(err, BookingError::Authorization(Denied::NotOwner { .. })));
    f.life.reject(COMMERCIAL, rejected).await.unwrap();

    let asks_rejected = ApplicationFilter {
        status: Some(ApplicationStatus::Rejected),
        ..Default::default()
    };
    for filter in [ApplicationFilter::default(), asks_rejected.clone()] {
        let ids: Vec<i64> = f
            .life
            .commercial_queue(COMMERCIAL, &filter)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.application.id)
            .collect();
        assert!(!ids.contains(&rejected));
        let listed = f.life.list(COMMERCIAL, &filter).await.unwrap();
        assert!(listed.iter().all(|v| v.status != ApplicationStatus::Rejected));
    }
    let queue = f
        .life
        .commercial_queue(COMMERCIAL, &ApplicationFilter::default())
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].application.id, open);

    let all_rejected = f.life.list(ADMIN, &asks_rejected).await.unwrap();
    assert_eq!(all_rejected.len(), 1);
    assert_eq!(all_rejected[0].application.id, rejected);
}

#[tokio::test]
async fn cancellation_stops_at_the_verdict() {
    let f = fixture(3).await;

    let pending = f.life.submit(CUSTOMER, request(f.broadcast_id)).await.unwrap();
    let err = f.life.cancel(OTHER_CUSTOMER, pending.id).await.unwrap_err();
    assert!(matches!(err, BookingError::Authorization(Denied::NotOwner { .. })));
    f.life.cancel(CUSTOMER, pending.id).await.unwrap();
    assert!(matches!(
        f.life.get(CUSTOMER, pending.id).await.unwrap_err(),
        BookingError::NotFound { .. }
    ));

    let claimed = f.life.submit(CUSTOMER, request(f.broadcast_id)).await.unwrap();
    f.life.claim(AGENT, claimed.id).await.unwrap();
    f.life.cancel(CUSTOMER, claimed.id).await.unwrap();

    let handed = handed_off(&f).await;
    f.life.cancel(CUSTOMER, handed).await.unwrap();

    let approved = handed_off(&f).await;
    f.life.approve(COMMERCIAL, approved).await.unwrap();
    let err = f.life.cancel(CUSTOMER, approved).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Authorization(Denied::NotCancellable {
            status: ApplicationStatus::Approved,
            ..
        })
    ));
    assert_eq!(booked(&f).await, 1);
}

#[tokio::test]
async fn submission_guards() {
    let f = fixture(1).await;

    let err = f
        .life
        .submit(OTHER_CUSTOMER, request(f.broadcast_id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::Precondition(Precondition::PayoutDetailsMissing { customer_id: 11 })
    ));

    let err = f.life.submit(AGENT, request(f.broadcast_id)).await.unwrap_err();
    assert!(matches!(err, BookingError::Authorization(_)));

    let mut bad_phone = request(f.broadcast_id);
    bad_phone.contact_phone = "soon".into();
    assert!(matches!(
        f.life.submit(CUSTOMER, bad_phone).await.unwrap_err(),
        BookingError::Validation(_)
    ));

    let mut too_long = request(f.broadcast_id);
    too_long.duration_secs = 6 * 60 + 1;
    assert!(matches!(
        f.life.submit(CUSTOMER, too_long).await.unwrap_err(),
        BookingError::Validation(_)
    ));

    assert!(matches!(
        f.life.submit(CUSTOMER, request(999)).await.unwrap_err(),
        BookingError::NotFound { entity: "broadcast", id: 999 }
    ));

    f.clock.set(air_date().and_hms_opt(9, 0, 0).unwrap().and_utc());
    let err = f.life.submit(CUSTOMER, request(f.broadcast_id)).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Precondition(Precondition::ScheduleInPast { .. })
    ));
}

#[tokio::test]
async fn edits_belong_to_the_current_owner() {
    let f = fixture(2).await;
    let app = f.life.submit(CUSTOMER, request(f.broadcast_id)).await.unwrap();

    let edited = f
        .life
        .edit_fields(
            CUSTOMER,
            app.id,
            FieldEdit {
                duration_secs: Some(45),
                description: Some("  Longer spot  ".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.duration_secs, 45);
    assert_eq!(edited.cost_cents, 45_000);
    assert_eq!(edited.description, "Longer spot");

    let price = FieldEdit {
        cost_cents: Some(1),
        ..Default::default()
    };
    assert!(matches!(
        f.life.edit_fields(CUSTOMER, app.id, price.clone()).await.unwrap_err(),
        BookingError::Validation(_)
    ));
    assert!(matches!(
        f.life.edit_fields(AGENT, app.id, price.clone()).await.unwrap_err(),
        BookingError::Authorization(Denied::NotOwner { .. })
    ));

    f.life.claim(AGENT, app.id).await.unwrap();
    let note = FieldEdit {
        description: Some("agent note".into()),
        ..Default::default()
    };
    assert!(matches!(
        f.life.edit_fields(CUSTOMER, app.id, note.clone()).await.unwrap_err(),
        BookingError::Authorization(Denied::NotOwner { .. })
    ));
    let discounted = f.life.edit_fields(AGENT, app.id, price).await.unwrap();
    assert_eq!(discounted.cost_cents, 1);
    assert_eq!(discounted.duration_secs, 45);

    f.life.hand_off(AGENT, app.id).await.unwrap();
    assert!(matches!(
        f.life.edit_fields(AGENT, app.id, note).await.unwrap_err(),
        BookingError::Conflict(Conflict::StateMismatch { .. })
    ));
}

#[tokio::test]
async fn late_claim_after_hand_off_names_the_holder() {
    let f = fixture(2).await;
    let id = handed_off(&f).await;

    let err = f.life.claim(OTHER_AGENT, id).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Conflict(Conflict::AlreadyClaimed { holder: 20, .. })
    ));
}

#[tokio::test]
async fn moved_show_cannot_be_booked_after_it_aired() {
    let f = fixture(2).await;
    let show = catalog::list_active_shows(f.life.pool()).await.unwrap()[0].clone();
    catalog::update_show(
        f.life.pool(),
        ADMIN,
        show.id,
        ShowDraft {
            name: show.name.clone(),
            category: show.category.clone(),
            window: "07:00-08:00".into(),
            recurrence: show.recurrence.clone(),
            price_per_minute_cents: show.price_per_minute_cents,
        },
        f.clock.now(),
    )
    .await
    .unwrap();

    f.clock.set(air_date().and_hms_opt(8, 30, 0).unwrap().and_utc());
    let err = f.life.submit(CUSTOMER, request(f.broadcast_id)).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Precondition(Precondition::ScheduleInPast { .. })
    ));
}
