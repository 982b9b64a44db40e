//! The exercise session runtime.
//!
//! One `ExerciseSession` drives one practice session: it creates the attempt,
//! flashes each round's operands, runs the answer countdown, validates and
//! counts answers, and finalizes the attempt exactly once.
//!
//! The session never blocks. Network and disk calls are handed to a
//! [`Dispatch`] implementation as jobs; their results come back through
//! [`ExerciseSession::on_completion`]. Timers are deadline slots polled from
//! [`ExerciseSession::on_tick`]. Both are expected to be called from the same
//! loop thread.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::ApiClient;
use crate::attempts::{
    finalize_with_retry, newly_earned, Achievement, AchievementQueue, AchievementSource,
    AttemptRecorder, AttemptSettings, AttemptUpdate, NewAttempt,
};
use crate::error::{ServiceError, SessionError};
use crate::numbers::{LocalGenerator, NumberSource};
use crate::runtime::Dispatch;
use crate::session::{ExerciseKind, Feedback, NumberSequence, RoundResult, SessionConfig};
use crate::speech::{operand_text, NoopSpeaker, Speaker, SpeechOptions};
use crate::stats::StatsDb;
use crate::timer::{Clock, Countdown, CountdownStep, DisplaySequencer, DisplayStep, SystemClock};
use crate::validation::{
    answers_match, parse_answer, AnswerValidator, LocalValidator, ValidationRequest,
    ValidationResponse,
};

const MAX_ANSWER_LEN: usize = 12;

/// The services a session talks to
#[derive(Clone)]
pub struct Backend {
    pub numbers: Arc<dyn NumberSource>,
    pub validator: Arc<dyn AnswerValidator>,
    pub attempts: Arc<dyn AttemptRecorder>,
    pub achievements: Arc<dyn AchievementSource>,
}

impl Backend {
    /// Offline backend: in-process generator and validator, SQLite attempts
    pub fn local(db: Arc<StatsDb>, kind: ExerciseKind) -> Self {
        Self {
            numbers: Arc::new(LocalGenerator::new(kind)),
            validator: Arc::new(LocalValidator),
            attempts: db.clone(),
            achievements: db,
        }
    }

    pub fn remote(client: ApiClient) -> Self {
        let client = Arc::new(client);
        Self {
            numbers: client.clone(),
            validator: client.clone(),
            attempts: client.clone(),
            achievements: client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Phase {
    Idle,
    Initializing,
    /// Waiting for the round's numbers
    Loading,
    Displaying,
    AwaitingAnswer,
    /// Answer submitted, waiting for the validator
    Validating,
    Feedback,
    Completed,
    Failed,
}

impl Phase {
    pub fn accepts_input(&self) -> bool {
        matches!(self, Phase::AwaitingAnswer)
    }
}

/// Result of the initialization job
#[derive(Debug)]
pub struct Started {
    pub exercise_id: String,
    pub attempt_id: String,
    /// `None` when the snapshot could not be taken; no diff is shown then
    pub achievements: Option<Vec<Achievement>>,
}

/// Results of background jobs, fed back through `on_completion`
#[derive(Debug)]
pub enum Completion {
    Initialized(Result<Started, SessionError>),
    SequenceReady {
        round: u32,
        result: Result<NumberSequence, ServiceError>,
    },
    Validated {
        round: u32,
        answer: f64,
        result: Result<ValidationResponse, ServiceError>,
    },
    AttemptUpdated(Result<(), ServiceError>),
    Finalized {
        landed: bool,
        earned: Vec<Achievement>,
    },
}

pub struct ExerciseSession {
    config: SessionConfig,
    student_id: String,
    backend: Backend,
    dispatcher: Box<dyn Dispatch>,
    speaker: Box<dyn Speaker>,
    speech: Option<SpeechOptions>,
    clock: Box<dyn Clock>,

    phase: Phase,
    init_in_flight: bool,
    exercise_id: Option<String>,
    attempt_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    achievements_before: Option<Vec<Achievement>>,

    round: u32,
    sequence: Option<NumberSequence>,
    sequencer: DisplaySequencer,
    countdown: Countdown,
    answer_input: String,
    answer_opened_at: Option<Instant>,
    response_time: Duration,
    feedback: Feedback,
    total_attempts: u32,
    total_correct: u32,
    rounds: Vec<RoundResult>,
    error: Option<SessionError>,

    achievements: AchievementQueue,
    finalizing: bool,
    finalize_claimed: bool,
    torn_down: bool,
}

impl ExerciseSession {
    pub fn new<D: Dispatch + 'static>(
        config: SessionConfig,
        student_id: impl Into<String>,
        backend: Backend,
        dispatcher: D,
    ) -> Self {
        let dwell = if config.display_speed.is_finite() && config.display_speed > 0.0 {
            config.dwell()
        } else {
            Duration::ZERO
        };
        Self {
            config,
            student_id: student_id.into(),
            backend,
            dispatcher: Box::new(dispatcher),
            speaker: Box::new(NoopSpeaker),
            speech: None,
            clock: Box::new(SystemClock),
            phase: Phase::Idle,
            init_in_flight: false,
            exercise_id: None,
            attempt_id: None,
            started_at: None,
            achievements_before: None,
            round: 0,
            sequence: None,
            sequencer: DisplaySequencer::new(dwell),
            countdown: Countdown::default(),
            answer_input: String::new(),
            answer_opened_at: None,
            response_time: Duration::ZERO,
            feedback: Feedback::None,
            total_attempts: 0,
            total_correct: 0,
            rounds: Vec::new(),
            error: None,
            achievements: AchievementQueue::default(),
            finalizing: false,
            finalize_claimed: false,
            torn_down: false,
        }
    }

    /// Speak each operand through `speaker`
    pub fn with_speaker<S: Speaker + 'static>(mut self, speaker: S, opts: SpeechOptions) -> Self {
        self.speaker = Box::new(speaker);
        self.speech = Some(opts);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Creates the attempt and starts the first round.
    ///
    /// Returns `Ok(false)` without doing anything when initialization is
    /// already in flight or done, so repeated triggers create one attempt.
    pub fn start(&mut self) -> Result<bool, SessionError> {
        if self.torn_down || self.init_in_flight || self.attempt_id.is_some() {
            return Ok(false);
        }
        if !matches!(self.phase, Phase::Idle | Phase::Failed) {
            return Ok(false);
        }
        if self.student_id.trim().is_empty() {
            return Err(SessionError::InvalidConfig("missing student id".into()));
        }
        self.config.validate()?;

        self.init_in_flight = true;
        self.phase = Phase::Initializing;
        self.error = None;
        let started_at = Utc::now();
        self.started_at = Some(started_at);
        tracing::info!(
            "starting {} session for student {}",
            self.config.exercise_type_name,
            self.student_id
        );

        let config = self.config.clone();
        let student_id = self.student_id.clone();
        let backend = self.backend.clone();
        self.dispatcher.dispatch(Box::new(move || {
            Completion::Initialized(initialize(&backend, &config, &student_id, started_at))
        }));
        Ok(true)
    }

    /// Applies the result of a background job
    pub fn on_completion(&mut self, completion: Completion) {
        if self.torn_down {
            tracing::debug!("session torn down, dropping {:?}", completion);
            return;
        }
        match completion {
            Completion::Initialized(result) => self.on_initialized(result),
            Completion::SequenceReady { round, result } => self.on_sequence(round, result),
            Completion::Validated {
                round,
                answer,
                result,
            } => self.on_validated(round, answer, result),
            Completion::AttemptUpdated(Err(e)) => {
                tracing::warn!("attempt update failed, keeping local totals: {}", e);
            }
            Completion::AttemptUpdated(Ok(())) => {}
            Completion::Finalized { landed, earned } => {
                self.finalizing = false;
                if !landed {
                    tracing::warn!("session completed locally but the final update was lost");
                }
                self.achievements = AchievementQueue::new(earned);
            }
        }
    }

    /// Polls the active timer. Call on every loop tick.
    pub fn on_tick(&mut self) {
        if self.torn_down {
            return;
        }
        let now = self.clock.now();
        match self.phase {
            Phase::Displaying => {
                while let Some(step) = self.sequencer.poll(now) {
                    match step {
                        DisplayStep::Show(index) => self.show(index),
                        DisplayStep::Finished => {
                            self.open_answer(now);
                            break;
                        }
                    }
                }
            }
            Phase::AwaitingAnswer => {
                while let Some(step) = self.countdown.tick(now) {
                    match step {
                        CountdownStep::Tick(remaining) => {
                            tracing::trace!("{}s left to answer", remaining)
                        }
                        CountdownStep::Expired => {
                            self.on_timeout();
                            break;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    pub fn input_char(&mut self, c: char) -> bool {
        if !self.input_open() || self.answer_input.len() >= MAX_ANSWER_LEN {
            return false;
        }
        let accepted = c.is_ascii_digit()
            || (c == '-' && self.answer_input.is_empty())
            || ((c == '.' || c == ',') && !self.answer_input.contains(['.', ',']));
        if accepted {
            self.answer_input.push(c);
        }
        accepted
    }

    pub fn backspace(&mut self) {
        if self.input_open() {
            self.answer_input.pop();
        }
    }

    /// Replaces the whole answer field
    pub fn set_answer(&mut self, text: &str) -> bool {
        if !self.input_open() {
            return false;
        }
        self.answer_input = text.chars().take(MAX_ANSWER_LEN).collect();
        true
    }

    /// Sends the typed answer for validation. Ignored once time is up or when
    /// the field does not hold a number.
    pub fn submit(&mut self) -> bool {
        if !self.input_open() {
            return false;
        }
        let Some(answer) = parse_answer(&self.answer_input) else {
            return false;
        };
        let (Some(sequence), Some(exercise_id)) = (&self.sequence, &self.exercise_id) else {
            return false;
        };

        self.countdown.cancel();
        self.phase = Phase::Validating;
        let now = self.clock.now();
        self.response_time = self
            .answer_opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or_default();

        let req = ValidationRequest {
            exercise_id: exercise_id.clone(),
            numbers: sequence.numbers.clone(),
            student_answer: answer,
        };
        let round = self.round;
        let validator = Arc::clone(&self.backend.validator);
        self.dispatcher.dispatch(Box::new(move || Completion::Validated {
            round,
            answer,
            result: validator.validate(&req),
        }));
        true
    }

    /// Starts a fresh round. Totals and the attempt carry over.
    pub fn next_round(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        let allowed = match self.phase {
            Phase::Displaying | Phase::AwaitingAnswer | Phase::Feedback => true,
            Phase::Failed => self.attempt_id.is_some(),
            _ => false,
        };
        if !allowed {
            return false;
        }
        self.cancel_activity();
        self.feedback = Feedback::None;
        self.answer_input.clear();
        self.error = None;
        self.begin_round();
        true
    }

    /// Ends the session and finalizes the attempt
    pub fn end_session(&mut self) {
        if self.torn_down || self.phase == Phase::Completed {
            return;
        }
        self.cancel_activity();
        self.phase = Phase::Completed;
        tracing::info!(
            "session ended: {}/{} correct",
            self.total_correct,
            self.total_attempts
        );
        if self.attempt_id.is_some() {
            self.finalize();
        }
        // still initializing: the attempt is finalized as soon as it exists
    }

    /// Teardown. Stops every timer and utterance and finalizes the attempt
    /// synchronously if nothing has yet. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.torn_down {
            return;
        }
        self.cancel_activity();
        self.torn_down = true;
        match self.attempt_id.clone() {
            Some(attempt_id) => {
                if self.claim_finalize() {
                    let update = self.completion_update();
                    finalize_with_retry(&*self.backend.attempts, &attempt_id, &update);
                } else if self.finalizing {
                    tracing::info!("final update for attempt {} still in flight at teardown", attempt_id);
                }
            }
            None if self.init_in_flight => {
                tracing::warn!("session torn down while starting; its attempt may stay open");
            }
            None => {}
        }
    }

    pub fn acknowledge_achievement(&mut self) -> Option<&Achievement> {
        self.achievements.acknowledge()
    }

    fn on_initialized(&mut self, result: Result<Started, SessionError>) {
        self.init_in_flight = false;
        match result {
            Ok(started) => {
                tracing::info!(
                    "attempt {} created for exercise {}",
                    started.attempt_id,
                    started.exercise_id
                );
                self.exercise_id = Some(started.exercise_id);
                self.attempt_id = Some(started.attempt_id);
                self.achievements_before = started.achievements;
                if self.phase == Phase::Completed {
                    self.finalize();
                    return;
                }
                self.begin_round();
            }
            Err(e) => {
                tracing::error!("session initialization failed: {}", e);
                if self.phase != Phase::Completed {
                    self.fail(e);
                }
            }
        }
    }

    fn begin_round(&mut self) {
        let Some(exercise_id) = self.exercise_id.as_deref() else {
            return;
        };
        self.round += 1;
        self.phase = Phase::Loading;
        self.sequence = None;
        self.sequencer.reset();
        let req = self.config.number_request(exercise_id);
        let round = self.round;
        let numbers = Arc::clone(&self.backend.numbers);
        tracing::debug!("fetching numbers for round {}", round);
        self.dispatcher.dispatch(Box::new(move || Completion::SequenceReady {
            round,
            result: numbers.generate(&req),
        }));
    }

    fn on_sequence(&mut self, round: u32, result: Result<NumberSequence, ServiceError>) {
        if round != self.round || self.phase != Phase::Loading {
            tracing::debug!("dropping numbers for stale round {}", round);
            return;
        }
        match result {
            Ok(sequence) if sequence.is_playable() => {
                let len = sequence.len();
                self.sequence = Some(sequence);
                let now = self.clock.now();
                match self.sequencer.start(now, len) {
                    Some(first) => {
                        self.phase = Phase::Displaying;
                        self.show(first);
                    }
                    None => tracing::warn!("display loop already running for round {}", round),
                }
            }
            Ok(_) => self.fail(SessionError::Generation(ServiceError::Unavailable(
                "received an empty number sequence".into(),
            ))),
            Err(e) => {
                tracing::error!("number generation failed for round {}: {}", round, e);
                self.fail(SessionError::Generation(e));
            }
        }
    }

    fn show(&mut self, index: usize) {
        let Some(value) = self.sequence.as_ref().and_then(|s| s.numbers.get(index)).copied() else {
            return;
        };
        tracing::trace!("showing operand {} = {}", index, value);
        if let Some(opts) = &self.speech {
            self.speaker.cancel();
            self.speaker.speak(&operand_text(value), opts);
        }
    }

    fn open_answer(&mut self, now: Instant) {
        self.phase = Phase::AwaitingAnswer;
        self.answer_input.clear();
        self.answer_opened_at = Some(now);
        self.countdown.start(now, self.config.time_per_question);
    }

    fn on_timeout(&mut self) {
        self.countdown.cancel();
        self.speaker.cancel();
        self.response_time = Duration::from_secs(self.config.time_per_question as u64);
        tracing::debug!("round {} timed out", self.round);
        self.record_outcome(Feedback::Timeout, None);
    }

    fn on_validated(
        &mut self,
        round: u32,
        answer: f64,
        result: Result<ValidationResponse, ServiceError>,
    ) {
        if round != self.round || self.phase != Phase::Validating {
            tracing::debug!("dropping validation for stale round {}", round);
            return;
        }
        let Some(expected) = self.sequence.as_ref().map(|s| s.expected_answer) else {
            return;
        };
        let correct = match result {
            Ok(response) => response.is_correct,
            Err(e) => {
                tracing::warn!("validator unavailable, comparing locally: {}", e);
                answers_match(expected, answer)
            }
        };
        let feedback = if correct {
            Feedback::Correct
        } else {
            Feedback::Incorrect
        };
        self.record_outcome(feedback, Some(answer));
    }

    fn record_outcome(&mut self, feedback: Feedback, answer: Option<f64>) {
        self.total_attempts += 1;
        if feedback.is_correct() {
            self.total_correct += 1;
        }
        self.feedback = feedback;
        self.phase = Phase::Feedback;
        if let Some(sequence) = &self.sequence {
            self.rounds.push(RoundResult {
                numbers: sequence.numbers.clone(),
                expected_answer: sequence.expected_answer,
                answer,
                feedback,
                response_time: self.response_time,
            });
        }
        tracing::info!(
            "round {}: {} ({}/{})",
            self.round,
            feedback,
            self.total_correct,
            self.total_attempts
        );
        self.push_totals();
    }

    /// Best-effort running-total update; the local counters stay authoritative
    fn push_totals(&self) {
        if self.finalize_claimed {
            return;
        }
        let Some(attempt_id) = self.attempt_id.clone() else {
            return;
        };
        let update = AttemptUpdate::totals(self.total_attempts, self.total_correct);
        let attempts = Arc::clone(&self.backend.attempts);
        self.dispatcher.dispatch(Box::new(move || {
            Completion::AttemptUpdated(attempts.update(&attempt_id, &update))
        }));
    }

    fn finalize(&mut self) {
        let Some(attempt_id) = self.attempt_id.clone() else {
            return;
        };
        if !self.claim_finalize() {
            tracing::debug!("attempt {} already finalized", attempt_id);
            return;
        }
        let update = self.completion_update();
        let attempts = Arc::clone(&self.backend.attempts);
        let achievements = Arc::clone(&self.backend.achievements);
        let student_id = self.student_id.clone();
        let before = self.achievements_before.clone();
        self.finalizing = true;
        self.dispatcher.dispatch(Box::new(move || {
            let landed = finalize_with_retry(&*attempts, &attempt_id, &update);
            let earned = match before {
                Some(before) => match achievements.achievements(&student_id) {
                    Ok(after) => newly_earned(&before, &after),
                    Err(e) => {
                        tracing::warn!("could not load achievements after the session: {}", e);
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            Completion::Finalized { landed, earned }
        }));
    }

    /// Check-and-set of the one-shot finalize guard
    fn claim_finalize(&mut self) -> bool {
        !std::mem::replace(&mut self.finalize_claimed, true)
    }

    fn completion_update(&self) -> AttemptUpdate {
        AttemptUpdate::completion(self.total_attempts, self.total_correct, Utc::now())
    }

    fn fail(&mut self, error: SessionError) {
        self.cancel_activity();
        self.phase = Phase::Failed;
        self.error = Some(error);
    }

    fn cancel_activity(&mut self) {
        self.sequencer.cancel();
        self.countdown.cancel();
        self.speaker.cancel();
    }

    fn input_open(&self) -> bool {
        !self.torn_down && self.phase.accepts_input() && self.countdown.remaining() > 0
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn attempt_id(&self) -> Option<&str> {
        self.attempt_id.as_deref()
    }

    pub fn exercise_id(&self) -> Option<&str> {
        self.exercise_id.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Index of the operand on screen, only while displaying
    pub fn display_index(&self) -> Option<usize> {
        match self.phase {
            Phase::Displaying => self.sequencer.index(),
            _ => None,
        }
    }

    pub fn current_operand(&self) -> Option<i64> {
        let index = self.display_index()?;
        self.sequence.as_ref()?.numbers.get(index).copied()
    }

    /// The round's numbers, hidden until the student has answered
    pub fn revealed_sequence(&self) -> Option<&NumberSequence> {
        match self.phase {
            Phase::Feedback | Phase::Completed => self.sequence.as_ref(),
            _ => None,
        }
    }

    pub fn card_count(&self) -> usize {
        self.sequence
            .as_ref()
            .map_or(self.config.card_count, |s| s.len())
    }

    pub fn remaining_secs(&self) -> Option<u32> {
        match self.phase {
            Phase::AwaitingAnswer => Some(self.countdown.remaining()),
            _ => None,
        }
    }

    pub fn answer_input(&self) -> &str {
        &self.answer_input
    }

    pub fn feedback(&self) -> Feedback {
        self.feedback
    }

    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    pub fn total_correct(&self) -> u32 {
        self.total_correct
    }

    pub fn rounds(&self) -> &[RoundResult] {
        &self.rounds
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn achievements(&self) -> &AchievementQueue {
        &self.achievements
    }

    /// True while the final update (and achievement diff) is in flight
    pub fn is_finalizing(&self) -> bool {
        self.finalizing
    }

    /// True while attempt creation or the final update has not come back yet.
    /// Leaving the loop before this clears loses the write.
    pub fn has_pending_writes(&self) -> bool {
        self.init_in_flight || self.finalizing
    }

    pub fn is_finalized(&self) -> bool {
        self.finalize_claimed
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Whether a display or countdown timer is pending
    pub fn has_active_timer(&self) -> bool {
        self.sequencer.is_running() || self.countdown.is_running()
    }
}

impl Drop for ExerciseSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn initialize(
    backend: &Backend,
    config: &SessionConfig,
    student_id: &str,
    started_at: DateTime<Utc>,
) -> Result<Started, SessionError> {
    let exercise_id = match &config.exercise_id {
        Some(id) => id.clone(),
        None => backend
            .numbers
            .create_exercise(config)
            .map_err(SessionError::Initialization)?,
    };
    let attempt_id = backend
        .attempts
        .create(&NewAttempt {
            student_id: student_id.to_string(),
            exercise_id: exercise_id.clone(),
            started_at,
            settings: AttemptSettings::from(config),
        })
        .map_err(SessionError::Initialization)?;
    let achievements = match backend.achievements.achievements(student_id) {
        Ok(list) => Some(list),
        Err(e) => {
            tracing::warn!("could not snapshot achievements: {}", e);
            None
        }
    };
    Ok(Started {
        exercise_id,
        attempt_id,
        achievements,
    })
}
