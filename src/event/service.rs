use std::sync::Arc;

use chrono::FixedOffset;
use serde::Serialize;
use tracing::instrument;

use super::lifecycle::{
    CompletionDetails, EventPatch, NewEvent, apply_patch, build_event, ensure_creator,
    ensure_creator_or_supervisor, ensure_organizer, ensure_status,
};
use super::{EventError, EventResult};
use crate::attendance::token::{IssuedToken, TokenIssuer};
use crate::db::StoreError;
use crate::db::models::event::{Enrollment, Event, EventFilter, EventId, EventStatus};
use crate::db::models::user::Principal;
use crate::db::repositories::EventStore;
use crate::util::Clock;

use EventStatus::*;

/// An event together with the attendance code minted for it
#[derive(Debug, Clone, Serialize)]
pub struct EventWithToken {
    pub event: Event,
    pub attendance_code: Option<IssuedToken>,
}

/// Event management: creation, edits, status changes, token rotation and rosters.
#[derive(Debug, Clone)]
pub struct EventService {
    store: Arc<dyn EventStore>,
    issuer: Arc<TokenIssuer>,
    clock: Arc<dyn Clock>,
    utc_offset: FixedOffset,
}

impl EventService {
    pub fn new(
        store: Arc<dyn EventStore>,
        issuer: Arc<TokenIssuer>,
        clock: Arc<dyn Clock>,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            issuer,
            clock,
            utc_offset,
        }
    }

    async fn load(&self, id: &EventId) -> EventResult<Event> {
        self.store.get_event(id).await?.ok_or(EventError::NotFound)
    }

    fn lost_race(event: &EventId) -> EventError {
        tracing::warn!(event_id = %event, "event changed underneath a guarded update");
        EventError::Conflict("event was modified concurrently; reload and retry".into())
    }

    #[instrument(skip(self, new), fields(user_id = %principal.user_id))]
    pub async fn create(&self, principal: &Principal, new: NewEvent) -> EventResult<EventWithToken> {
        ensure_organizer(principal)?;

        let now = self.clock.now();
        let mut event = build_event(new, principal.user_id, self.utc_offset, now)?;
        let issued = self.issuer.issue(event.id, now)?;
        event.token = Some(issued.attendance_token());

        self.store.insert_event(&event).await?;
        tracing::info!(event_id = %event.id, "event created");

        Ok(EventWithToken {
            event,
            attendance_code: Some(issued),
        })
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &EventId) -> EventResult<Event> {
        self.load(id).await
    }

    #[instrument(skip(self))]
    pub async fn list(&self, filter: &EventFilter) -> EventResult<Vec<Event>> {
        Ok(self.store.list_events(filter).await?)
    }

    /// Creator-only structural edit. Moving the schedule or the coordinates re-derives the
    /// attendance window and replaces the token.
    #[instrument(skip(self, patch), fields(user_id = %principal.user_id))]
    pub async fn update(
        &self,
        principal: &Principal,
        id: &EventId,
        patch: EventPatch,
    ) -> EventResult<EventWithToken> {
        let mut event = self.load(id).await?;
        ensure_creator(&event, principal, "edit it")?;
        ensure_status(&event, &[Upcoming, Active], "edit")?;

        let impact = apply_patch(&mut event, patch, self.utc_offset)?;
        let issued = if impact.rotate_token {
            Some(self.issuer.issue(event.id, self.clock.now())?)
        } else {
            None
        };
        let token = issued.as_ref().map(IssuedToken::attendance_token);

        if !self.store.update_event(&event, token.as_ref()).await? {
            return Err(Self::lost_race(id));
        }
        if let Some(token) = token {
            event.token = Some(token);
            tracing::info!(event_id = %id, "schedule or location changed; token rotated");
        }

        Ok(EventWithToken {
            event,
            attendance_code: issued,
        })
    }

    #[instrument(skip(self), fields(user_id = %principal.user_id))]
    pub async fn delete(&self, principal: &Principal, id: &EventId) -> EventResult<()> {
        let event = self.load(id).await?;
        ensure_creator_or_supervisor(&event, principal, "delete it")?;
        ensure_status(&event, &[Upcoming, Cancelled], "delete")?;

        if !self.store.delete_event(id).await? {
            return Err(Self::lost_race(id));
        }

        tracing::info!(event_id = %id, "event deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %principal.user_id))]
    pub async fn set_status(
        &self,
        principal: &Principal,
        id: &EventId,
        status: EventStatus,
    ) -> EventResult<Event> {
        let event = self.load(id).await?;
        ensure_creator_or_supervisor(&event, principal, "change its status")?;
        if event.status.is_terminal() {
            return Err(EventError::Conflict(format!(
                "cannot change the status of an event that is {}",
                event.status
            )));
        }

        if !self.store.set_status(id, status).await? {
            return Err(Self::lost_race(id));
        }

        tracing::info!(event_id = %id, from = %event.status, to = %status, "event status changed");
        self.load(id).await
    }

    /// Stores post-event metrics and marks the event completed
    #[instrument(skip(self, details), fields(user_id = %principal.user_id))]
    pub async fn complete(
        &self,
        principal: &Principal,
        id: &EventId,
        details: CompletionDetails,
    ) -> EventResult<Event> {
        let event = self.load(id).await?;
        ensure_creator(&event, principal, "submit completion details")?;
        ensure_status(&event, &[Active, Completed], "submit completion details for")?;
        let summary = details.validate()?;

        if !self.store.set_summary(id, &summary).await? {
            return Err(Self::lost_race(id));
        }

        self.load(id).await
    }

    #[instrument(skip(self), fields(user_id = %principal.user_id))]
    pub async fn refresh_token(&self, principal: &Principal, id: &EventId) -> EventResult<IssuedToken> {
        let event = self.load(id).await?;
        ensure_creator(&event, principal, "refresh its attendance code")?;
        ensure_status(&event, &[Upcoming, Active], "refresh the attendance code of")?;

        let issued = self.issuer.issue(event.id, self.clock.now())?;
        if !self.store.set_token(id, &issued.attendance_token()).await? {
            return Err(Self::lost_race(id));
        }

        tracing::info!(event_id = %id, expires_at = %issued.expires_at, "token rotated");
        Ok(issued)
    }

    #[instrument(skip(self), fields(user_id = %principal.user_id))]
    pub async fn current_token(&self, principal: &Principal, id: &EventId) -> EventResult<IssuedToken> {
        let event = self.load(id).await?;
        ensure_creator_or_supervisor(&event, principal, "view its attendance code")?;
        ensure_status(&event, &[Upcoming, Active], "show the attendance code of")?;

        let current = event.token.as_ref().ok_or_else(|| {
            EventError::Conflict("event has no attendance code; refresh it first".into())
        })?;

        Ok(IssuedToken::for_current(event.id, current)?)
    }

    #[instrument(skip(self), fields(user_id = %principal.user_id))]
    pub async fn enroll(&self, principal: &Principal, id: &EventId) -> EventResult<Event> {
        let event = self.load(id).await?;
        ensure_status(&event, &[Upcoming, Active], "enroll in")?;
        if event.is_enrolled(&principal.user_id) {
            return Err(EventError::Conflict(
                "already enrolled in this event".into(),
            ));
        }

        match self.store.enroll(id, &principal.user_id).await {
            Ok(true) => (),
            Ok(false) => return Err(Self::lost_race(id)),
            Err(StoreError::Duplicate(_)) => {
                return Err(EventError::Conflict(
                    "already enrolled in this event".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(event_id = %id, "enrolled");
        self.load(id).await
    }

    #[instrument(skip(self), fields(user_id = %principal.user_id))]
    pub async fn leave(&self, principal: &Principal, id: &EventId) -> EventResult<Event> {
        let event = self.load(id).await?;
        if event.status.is_terminal() {
            return Err(EventError::Conflict(format!(
                "cannot leave an event that is {}",
                event.status
            )));
        }

        if !self.store.unenroll(id, &principal.user_id).await? {
            return Err(EventError::Conflict(
                "not currently enrolled in this event".into(),
            ));
        }

        tracing::info!(event_id = %id, "left event");
        self.load(id).await
    }

    #[instrument(skip(self), fields(user_id = %principal.user_id))]
    pub async fn roster(&self, principal: &Principal, id: &EventId) -> EventResult<Vec<Enrollment>> {
        let event = self.load(id).await?;
        ensure_creator_or_supervisor(&event, principal, "view its roster")?;

        Ok(event.enrolled)
    }

    /// Loads `id` if `principal` may audit its attendance
    #[instrument(skip(self), fields(user_id = %principal.user_id))]
    pub async fn audit(&self, principal: &Principal, id: &EventId) -> EventResult<Event> {
        let event = self.load(id).await?;
        ensure_creator_or_supervisor(&event, principal, "view its attendance")?;

        Ok(event)
    }
}
