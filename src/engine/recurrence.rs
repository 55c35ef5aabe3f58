use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::*;

use super::{Engine, EngineError};

/// Result of one materialization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// Nothing to do: rule not active, finished, or its next date is ahead.
    NotDue,
    Booked(Reservation),
    /// Recorded on the rule and reported to the user; the rule still advanced.
    Failed(String),
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(date.weekday().num_days_from_monday() as u64)
}

/// Whole weeks between the Monday-based weeks of `anchor` and `date`.
fn weeks_between(anchor: NaiveDate, date: NaiveDate) -> i64 {
    (week_start(date) - week_start(anchor)).num_days().div_euclid(7)
}

/// Whether `date` is a valid occurrence day for a filter pattern. Period
/// patterns accept any day; their cadence comes from `next_occurrence`.
pub fn matches_pattern(pattern: &Pattern, interval: u32, anchor: NaiveDate, date: NaiveDate) -> bool {
    match pattern {
        Pattern::Daily | Pattern::Weekly | Pattern::Monthly => true,
        Pattern::Weekdays => !is_weekend(date.weekday()),
        Pattern::Weekends => is_weekend(date.weekday()),
        Pattern::Custom { days } => {
            days.contains(&date.weekday())
                && weeks_between(anchor, date).rem_euclid(interval.max(1) as i64) == 0
        }
    }
}

/// First matching date at or after `from`, within a bounded scan.
fn scan_forward(pattern: &Pattern, interval: u32, anchor: NaiveDate, from: NaiveDate) -> Option<NaiveDate> {
    let mut date = from;
    for _ in 0..=MAX_FILTER_SCAN_DAYS {
        if matches_pattern(pattern, interval, anchor, date) {
            return Some(date);
        }
        date = date.succ_opt()?;
    }
    None
}

/// `months` months after `date`, on `anchor_day` or the month's last day if shorter.
fn add_months_anchored(date: NaiveDate, months: u32, anchor_day: u32) -> Option<NaiveDate> {
    let target = date.with_day(1)?.checked_add_months(Months::new(months))?;
    let last_day = target.checked_add_months(Months::new(1))?.pred_opt()?.day();
    target.with_day(anchor_day.min(last_day))
}

/// The rule's first occurrence: `start_date`, or the first matching day for filters.
pub fn first_occurrence(pattern: &Pattern, interval: u32, start_date: NaiveDate) -> Option<NaiveDate> {
    if pattern.is_filter() {
        scan_forward(pattern, interval, start_date, start_date)
    } else {
        Some(start_date)
    }
}

/// The occurrence after `rule.next_occurrence`. None if the calendar runs out.
pub fn next_occurrence(rule: &RecurrenceRule) -> Option<NaiveDate> {
    let current = rule.next_occurrence;
    let interval = rule.interval.max(1);
    match &rule.pattern {
        Pattern::Daily => current.checked_add_days(Days::new(interval as u64)),
        Pattern::Weekly => current.checked_add_days(Days::new(7 * interval as u64)),
        Pattern::Monthly => add_months_anchored(current, interval, rule.start_date.day()),
        pattern => scan_forward(pattern, interval, rule.start_date, current.succ_opt()?),
    }
}

pub fn is_finished(rule: &RecurrenceRule, today: NaiveDate) -> bool {
    rule.status == RuleStatus::Completed
        || rule
            .max_occurrences
            .is_some_and(|max| rule.occurrence_count >= max)
        || rule
            .end_date
            .is_some_and(|end| end < today || rule.next_occurrence > end)
}

pub fn is_due(rule: &RecurrenceRule, today: NaiveDate) -> bool {
    rule.status == RuleStatus::Active && !is_finished(rule, today) && today >= rule.next_occurrence
}

/// The reservation window for an occurrence on `date`, in UTC.
pub fn occurrence_span(rule: &RecurrenceRule, date: NaiveDate) -> Option<Span> {
    let start = date.and_time(rule.start_time).and_utc().timestamp_millis();
    let end = start.checked_add(rule.duration_minutes as Ms * MINUTE_MS)?;
    Some(Span::new(start, end))
}

/// Step past the current occurrence, skipping any dates already behind
/// `today`, and complete the rule when nothing is left.
fn advance(rule: &mut RecurrenceRule, today: NaiveDate) {
    loop {
        match next_occurrence(rule) {
            Some(next) => rule.next_occurrence = next,
            None => {
                rule.status = RuleStatus::Completed;
                return;
            }
        }
        if rule.next_occurrence >= today || is_finished(rule, today) {
            break;
        }
    }
    if is_finished(rule, today) {
        rule.status = RuleStatus::Completed;
    }
}

fn illegal(rule: &RecurrenceRule, action: &'static str, reason: &'static str) -> EngineError {
    EngineError::InvalidStateTransition {
        id: rule.id,
        state: rule.status.as_str(),
        action,
        reason,
    }
}

impl Engine {
    pub async fn create_recurrence_rule(
        &self,
        request: RuleRequest,
    ) -> Result<RecurrenceRule, EngineError> {
        if request.interval == 0 {
            return Err(EngineError::validation("interval must be at least 1"));
        }
        if request.interval > MAX_RECURRENCE_INTERVAL {
            return Err(EngineError::LimitExceeded("interval too large"));
        }
        if request.duration_minutes == 0 {
            return Err(EngineError::validation("duration must be positive"));
        }
        if request.duration_minutes > MAX_RECURRENCE_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("duration too long"));
        }
        if let Pattern::Custom { days } = &request.pattern
            && days.is_empty()
        {
            return Err(EngineError::validation("custom pattern needs at least one weekday"));
        }
        if request.max_occurrences == Some(0) {
            return Err(EngineError::validation("max occurrences must be at least 1"));
        }
        if request.end_date.is_some_and(|end| end < request.start_date) {
            return Err(EngineError::validation("end date is before start date"));
        }
        let today = self.clock.today();
        if request.start_date < today {
            return Err(EngineError::validation("start date is in the past"));
        }
        self.resource(request.resource_id).await?;

        let Some(first) = first_occurrence(&request.pattern, request.interval, request.start_date)
        else {
            return Err(EngineError::validation("pattern never matches"));
        };
        if request.end_date.is_some_and(|end| first > end) {
            return Err(EngineError::validation("no occurrence before the end date"));
        }

        let rule = RecurrenceRule {
            id: Ulid::new(),
            resource_id: request.resource_id,
            user_id: request.user_id,
            pattern: request.pattern,
            interval: request.interval,
            start_time: request.start_time,
            duration_minutes: request.duration_minutes,
            start_date: request.start_date,
            end_date: request.end_date,
            max_occurrences: request.max_occurrences,
            next_occurrence: first,
            occurrence_count: 0,
            occurrences: Vec::new(),
            failures: Vec::new(),
            status: RuleStatus::Active,
            vehicle: request.vehicle,
            created_at: self.now(),
        };
        self.store.put_rule(&rule).await?;
        self.publish_rule(&rule);
        info!("recurrence rule {} created, first occurrence {first}", rule.id);
        Ok(rule)
    }

    /// Book the rule's next occurrence if it is due, then advance the rule.
    ///
    /// A booking that fails for any reason other than the store is recorded
    /// on the rule and reported to the user, and the rule still advances.
    /// A store failure leaves the rule untouched for the next tick, which
    /// adopts any reservation already made for the date instead of booking
    /// it twice.
    pub async fn materialize(&self, rule_id: Ulid) -> Result<MaterializeOutcome, EngineError> {
        let _rule_guard = self.lock(rule_id).await;
        let mut rule = self.rule(rule_id).await?;
        let today = self.clock.today();
        if !is_due(&rule, today) {
            return Ok(MaterializeOutcome::NotDue);
        }

        let date = rule.next_occurrence;
        let attempt = match occurrence_span(&rule, date) {
            Some(span) => {
                let request = ReservationRequest {
                    resource_id: rule.resource_id,
                    user_id: rule.user_id,
                    span,
                    vehicle: rule.vehicle.clone(),
                };
                let _guard = self.lock(rule.resource_id).await;
                let source = BookingSource::Recurrence { rule_id };
                // Booked by an earlier run whose rule write did not land.
                let earlier = self
                    .store
                    .overlapping_reservations(rule.resource_id, span)
                    .await?
                    .into_iter()
                    .find(|r| r.source == source && r.span == span);
                match earlier {
                    Some(reservation) => {
                        info!("rule {rule_id} already booked {date} as {}", reservation.id);
                        Ok(reservation)
                    }
                    None => self.create_locked(request, source).await,
                }
            }
            None => Err(EngineError::LimitExceeded("occurrence time out of range")),
        };

        let now = self.now();
        let outcome = match attempt {
            Ok(reservation) => {
                rule.occurrences.push(OccurrenceRecord {
                    date,
                    reservation_id: reservation.id,
                    created_at: now,
                });
                rule.occurrence_count += 1;
                metrics::counter!(RECURRENCE_OCCURRENCES_TOTAL, "outcome" => "booked").increment(1);
                info!("rule {rule_id} booked {date} as {}", reservation.id);
                MaterializeOutcome::Booked(reservation)
            }
            Err(e) if e.is_store() => return Err(e),
            Err(e) => {
                let reason = e.to_string();
                rule.failures.push(FailureRecord {
                    date,
                    reason: reason.clone(),
                    failed_at: now,
                });
                metrics::counter!(RECURRENCE_OCCURRENCES_TOTAL, "outcome" => "failed").increment(1);
                warn!("rule {rule_id} could not book {date}: {reason}");
                self.enqueue(
                    rule.user_id,
                    rule.id,
                    Payload::RecurringBookingFailed {
                        rule_id,
                        date,
                        reason: reason.clone(),
                    },
                    None,
                )
                .await;
                MaterializeOutcome::Failed(reason)
            }
        };

        advance(&mut rule, today);
        self.store.put_rule(&rule).await?;
        self.publish_rule(&rule);
        if rule.status == RuleStatus::Completed {
            info!("rule {rule_id} completed after {} occurrences", rule.occurrence_count);
        }
        Ok(outcome)
    }

    /// ACTIVE rules with an occurrence due today or earlier.
    pub async fn due_rule_ids(&self) -> Result<Vec<Ulid>, EngineError> {
        let today = self.clock.today();
        let mut due: Vec<RecurrenceRule> = self
            .store
            .list_rules()
            .await?
            .into_iter()
            .filter(|r| is_due(r, today))
            .collect();
        due.sort_by_key(|r| (r.next_occurrence, r.id));
        Ok(due.into_iter().map(|r| r.id).collect())
    }

    pub async fn pause_recurrence_rule(&self, rule_id: Ulid) -> Result<RecurrenceRule, EngineError> {
        self.update_rule(rule_id, |rule, _| {
            if rule.status != RuleStatus::Active {
                return Err(illegal(rule, "pause", "rule is not active"));
            }
            rule.status = RuleStatus::Paused;
            Ok(())
        })
        .await
    }

    /// Reactivate a paused rule. Dates missed while paused are skipped.
    pub async fn resume_recurrence_rule(&self, rule_id: Ulid) -> Result<RecurrenceRule, EngineError> {
        self.update_rule(rule_id, |rule, today| {
            if rule.status != RuleStatus::Paused {
                return Err(illegal(rule, "resume", "rule is not paused"));
            }
            rule.status = RuleStatus::Active;
            if rule.next_occurrence < today {
                rule.next_occurrence = if rule.pattern.is_filter() {
                    scan_forward(&rule.pattern, rule.interval, rule.start_date, today)
                        .ok_or_else(|| EngineError::validation("pattern never matches"))?
                } else {
                    today
                };
            }
            if is_finished(rule, today) {
                rule.status = RuleStatus::Completed;
            }
            Ok(())
        })
        .await
    }

    pub async fn cancel_recurrence_rule(&self, rule_id: Ulid) -> Result<RecurrenceRule, EngineError> {
        self.update_rule(rule_id, |rule, _| {
            if !matches!(rule.status, RuleStatus::Active | RuleStatus::Paused) {
                return Err(illegal(rule, "cancel", "rule already ended"));
            }
            rule.status = RuleStatus::Cancelled;
            Ok(())
        })
        .await
    }

    /// End a rule early, keeping the occurrences it already booked.
    pub async fn complete_recurrence_rule(&self, rule_id: Ulid) -> Result<RecurrenceRule, EngineError> {
        self.update_rule(rule_id, |rule, _| {
            if !matches!(rule.status, RuleStatus::Active | RuleStatus::Paused) {
                return Err(illegal(rule, "complete", "rule already ended"));
            }
            rule.status = RuleStatus::Completed;
            Ok(())
        })
        .await
    }

    async fn update_rule(
        &self,
        rule_id: Ulid,
        change: impl FnOnce(&mut RecurrenceRule, NaiveDate) -> Result<(), EngineError>,
    ) -> Result<RecurrenceRule, EngineError> {
        let _guard = self.lock(rule_id).await;
        let mut rule = self.rule(rule_id).await?;
        change(&mut rule, self.clock.today())?;
        self.store.put_rule(&rule).await?;
        self.publish_rule(&rule);
        info!("rule {rule_id} is now {}", rule.status.as_str());
        Ok(rule)
    }

    fn publish_rule(&self, rule: &RecurrenceRule) {
        self.publish(LiveEvent::RecurrenceChanged {
            rule_id: rule.id,
            resource_id: rule.resource_id,
            status: rule.status,
            next_occurrence: rule.next_occurrence,
        });
    }
}
