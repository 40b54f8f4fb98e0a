//! In-process stand-in for the Postgres repositories, used by the service and router tests.
//!
//! Mirrors the storage guarantees the service relies on: status-guarded updates, the
//! `(event_id, user_id)` uniqueness of attendance, and atomic point increments. An adjustable
//! artificial latency lets tests push calls past the store timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use tokio::sync::RwLock;

use crate::attendance::geo::GeoPoint;
use crate::db::models::attendance::{AttendanceFilter, AttendanceRecord};
use crate::db::models::event::{
    AttendanceToken, AttendanceWindow, CompletionSummary, Enrollment, Event, EventFilter, EventId,
    EventStatus, Schedule,
};
use crate::db::models::user::UserId;
use crate::db::repositories::{AttendanceStore, EventStore, PointsLedger};
use crate::db::{StoreError, StoreResult, timed};

use EventStatus::*;

/// Increment shared by `award` and `commit_attendance`; callers hold the ledger write lock
fn credit(ledger: &mut HashMap<UserId, i64>, user_id: &UserId, points: u32) -> i64 {
    let total = ledger.entry(*user_id).or_insert(0);
    *total += i64::from(points);
    *total
}

/// Upcoming event at Juhu Beach (19.0760, 72.8777), 1 km radius, window `at` +/- 30 minutes, no
/// token and an empty roster
pub fn event_fixture(created_by: UserId, at: DateTime<Utc>) -> Event {
    Event {
        id: EventId::new(),
        title: "Juhu beach sweep".into(),
        description: "Morning cleanup along the northern stretch of the beach".into(),
        schedule: Schedule {
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap_or_default(),
            start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default(),
            end_time: NaiveTime::from_hms_opt(13, 0, 0).unwrap_or_default(),
        },
        location_name: "Juhu Beach, Mumbai".into(),
        location: GeoPoint {
            latitude: 19.0760,
            longitude: 72.8777,
        },
        geofence_radius_km: 1.0,
        status: EventStatus::Upcoming,
        token: None,
        window: AttendanceWindow {
            start: at - TimeDelta::minutes(30),
            end: at + TimeDelta::minutes(30),
        },
        created_by,
        enrolled: Vec::new(),
        summary: CompletionSummary::default(),
        created_at: at,
        updated_at: at,
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    events: RwLock<HashMap<EventId, Event>>,
    attendance: RwLock<Vec<AttendanceRecord>>,
    points: RwLock<HashMap<UserId, i64>>,
    latency_ms: AtomicU64,
    timeout: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(2))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            events: RwLock::default(),
            attendance: RwLock::default(),
            points: RwLock::default(),
            latency_ms: AtomicU64::new(0),
            timeout,
        }
    }

    /// Delay applied before every subsequent call
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn attendance_count(&self) -> usize {
        self.attendance.read().await.len()
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn guarded<F>(&self, id: &EventId, allowed: &[EventStatus], f: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut Event) + Send,
    {
        timed(self.timeout, async {
            self.delay().await;
            let mut events = self.events.write().await;

            Ok::<_, StoreError>(match events.get_mut(id) {
                Some(event) if allowed.contains(&event.status) => {
                    f(event);
                    event.updated_at = Utc::now();
                    true
                }
                _ => false,
            })
        })
        .await
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: &Event) -> StoreResult<()> {
        timed(self.timeout, async {
            self.delay().await;
            let mut events = self.events.write().await;
            if events.contains_key(&event.id) {
                return Err(StoreError::Duplicate("events_pkey".into()));
            }
            events.insert(event.id, event.clone());
            Ok(())
        })
        .await
    }

    async fn get_event(&self, id: &EventId) -> StoreResult<Option<Event>> {
        timed(self.timeout, async {
            self.delay().await;
            Ok::<_, StoreError>(self.events.read().await.get(id).cloned())
        })
        .await
    }

    async fn list_events(&self, filter: &EventFilter) -> StoreResult<Vec<Event>> {
        timed(self.timeout, async {
            self.delay().await;
            let mut events: Vec<Event> = self
                .events
                .read()
                .await
                .values()
                .filter(|e| filter.status.is_none_or(|s| s == e.status))
                .filter(|e| filter.created_by.is_none_or(|c| c == e.created_by))
                .cloned()
                .collect();

            events.sort_by_key(|e| (e.schedule.date, e.schedule.start_time, e.created_at));
            Ok::<_, StoreError>(events)
        })
        .await
    }

    async fn update_event(
        &self,
        event: &Event,
        token: Option<&AttendanceToken>,
    ) -> StoreResult<bool> {
        let update = event.clone();
        let token = token.cloned();

        self.guarded(&event.id, &[Upcoming, Active], move |stored| {
            stored.title = update.title;
            stored.description = update.description;
            stored.schedule = update.schedule;
            stored.location_name = update.location_name;
            stored.location = update.location;
            stored.geofence_radius_km = update.geofence_radius_km;
            stored.window = update.window;
            if let Some(token) = token {
                stored.token = Some(token);
            }
        })
        .await
    }

    async fn set_status(&self, id: &EventId, status: EventStatus) -> StoreResult<bool> {
        self.guarded(id, &[Upcoming, Active], move |stored| stored.status = status)
            .await
    }

    async fn set_token(&self, id: &EventId, token: &AttendanceToken) -> StoreResult<bool> {
        let token = token.clone();
        self.guarded(id, &[Upcoming, Active], move |stored| {
            stored.token = Some(token)
        })
        .await
    }

    async fn set_summary(&self, id: &EventId, summary: &CompletionSummary) -> StoreResult<bool> {
        let summary = summary.clone();
        self.guarded(id, &[Active, Completed], move |stored| {
            stored.summary = summary;
            stored.status = Completed;
        })
        .await
    }

    async fn delete_event(&self, id: &EventId) -> StoreResult<bool> {
        timed(self.timeout, async {
            self.delay().await;
            let mut events = self.events.write().await;

            let deletable = events
                .get(id)
                .is_some_and(|e| matches!(e.status, Upcoming | Cancelled));
            if deletable {
                events.remove(id);
            }

            Ok::<_, StoreError>(deletable)
        })
        .await
    }

    async fn enroll(&self, id: &EventId, user_id: &UserId) -> StoreResult<bool> {
        timed(self.timeout, async {
            self.delay().await;
            let mut events = self.events.write().await;

            match events.get_mut(id) {
                Some(event) if matches!(event.status, Upcoming | Active) => {
                    if event.is_enrolled(user_id) {
                        return Err(StoreError::Duplicate("event_enrollments_pkey".into()));
                    }
                    event.enrolled.push(Enrollment {
                        user_id: *user_id,
                        enrolled_at: Utc::now(),
                    });
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    async fn unenroll(&self, id: &EventId, user_id: &UserId) -> StoreResult<bool> {
        timed(self.timeout, async {
            self.delay().await;
            let mut events = self.events.write().await;

            Ok::<_, StoreError>(match events.get_mut(id) {
                Some(event) => {
                    let before = event.enrolled.len();
                    event.enrolled.retain(|e| &e.user_id != user_id);
                    event.enrolled.len() != before
                }
                None => false,
            })
        })
        .await
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn attendance_exists(&self, event_id: &EventId, user_id: &UserId) -> StoreResult<bool> {
        timed(self.timeout, async {
            self.delay().await;
            Ok::<_, StoreError>(
                self.attendance
                    .read()
                    .await
                    .iter()
                    .any(|r| &r.event_id == event_id && &r.user_id == user_id),
            )
        })
        .await
    }

    async fn commit_attendance(&self, record: &AttendanceRecord) -> StoreResult<i64> {
        timed(self.timeout, async {
            self.delay().await;
            // both locks held across check + insert + increment
            let mut attendance = self.attendance.write().await;
            let mut points = self.points.write().await;

            let duplicate = attendance
                .iter()
                .any(|r| r.event_id == record.event_id && r.user_id == record.user_id);
            if duplicate {
                return Err(StoreError::Duplicate("attendance_event_user_key".into()));
            }

            attendance.push(record.clone());
            Ok(credit(&mut points, &record.user_id, record.points_awarded))
        })
        .await
    }

    async fn list_attendance(&self, filter: &AttendanceFilter) -> StoreResult<Vec<AttendanceRecord>> {
        timed(self.timeout, async {
            self.delay().await;
            let mut records: Vec<AttendanceRecord> = self
                .attendance
                .read()
                .await
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();

            records.sort_by(|a, b| b.attended_at.cmp(&a.attended_at));
            Ok::<_, StoreError>(records)
        })
        .await
    }
}

#[async_trait]
impl PointsLedger for MemoryStore {
    async fn award(&self, user_id: &UserId, points: u32) -> StoreResult<i64> {
        timed(self.timeout, async {
            self.delay().await;
            let mut ledger = self.points.write().await;
            Ok::<_, StoreError>(credit(&mut ledger, user_id, points))
        })
        .await
    }

    async fn balance(&self, user_id: &UserId) -> StoreResult<i64> {
        timed(self.timeout, async {
            self.delay().await;
            Ok::<_, StoreError>(self.points.read().await.get(user_id).copied().unwrap_or(0))
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_awards_sum_exactly() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.award(&user, 3).await })
            })
            .collect();

        let totals: HashSet<i64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        // every increment observed a distinct running total
        assert_eq!(totals.len(), 50);
        assert_eq!(store.balance(&user).await.unwrap(), 150);
        assert_eq!(store.balance(&UserId::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_award_and_commit_share_a_balance() {
        let store = MemoryStore::new();
        let user = UserId::new();

        store.award(&user, 5).await.unwrap();
        let record = AttendanceRecord::verified(
            EventId::new(),
            user,
            Utc::now(),
            GeoPoint {
                latitude: 19.0761,
                longitude: 72.8778,
            },
            "t1",
            10,
        );
        assert_eq!(store.commit_attendance(&record).await.unwrap(), 15);

        assert!(matches!(
            store.commit_attendance(&record).await,
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.balance(&user).await.unwrap(), 15);
    }
}
