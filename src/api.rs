//! JSON/HTTP client for the remote exercise API.

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::attempts::{Achievement, AchievementSource, AttemptRecorder, AttemptUpdate, NewAttempt};
use crate::error::{ServiceError, ServiceResult};
use crate::numbers::NumberSource;
use crate::session::{NumberRequest, NumberSequence, SessionConfig};
use crate::validation::{AnswerValidator, ValidationRequest, ValidationResponse};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Servers hand out ids as strings or numbers
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum RemoteId {
    Text(String),
    Number(i64),
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        match id {
            RemoteId::Text(s) => s,
            RemoteId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Created {
    id: RemoteId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExerciseBody<'a> {
    exercise_type_id: &'a str,
    exercise_type_name: &'a str,
    card_count: usize,
    digit_length: u8,
    display_speed: f64,
    time_per_question: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<i64>,
}

impl<'a> From<&'a SessionConfig> for ExerciseBody<'a> {
    fn from(cfg: &'a SessionConfig) -> Self {
        Self {
            exercise_type_id: &cfg.exercise_type_id,
            exercise_type_name: &cfg.exercise_type_name,
            card_count: cfg.card_count,
            digit_length: cfg.digit_length,
            display_speed: cfg.display_speed,
            time_per_question: cfg.time_per_question,
            min: cfg.min,
            max: cfg.max,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteAchievement {
    id: RemoteId,
    title: String,
    #[serde(default)]
    description: Option<String>,
}

/// Blocking client; the session only calls it from worker threads
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> ServiceResult<Self> {
        let invalid = |reason: String| {
            ServiceError::Unavailable(format!("invalid API url {}: {}", base_url, reason))
        };
        let parsed = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("must start with http:// or https://".into()));
        }
        if parsed.cannot_be_a_base() {
            return Err(invalid("cannot hold a path".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: parsed,
            token,
        })
    }

    /// Appends `segments` to the base path, escaping each one
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn send(&self, req: RequestBuilder) -> ServiceResult<Response> {
        let response = self.authorized(req).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                message: response.text().unwrap_or_default(),
            });
        }
        Ok(response)
    }

    fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> ServiceResult<T> {
        let response = self.send(req)?;
        if response.status() == StatusCode::NO_CONTENT {
            return Err(ServiceError::Unavailable("empty response body".into()));
        }
        let body = response.text()?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl NumberSource for ApiClient {
    fn create_exercise(&self, config: &SessionConfig) -> ServiceResult<String> {
        let created: Created = self.json(
            self.client
                .post(self.url(&["exercises"]))
                .json(&ExerciseBody::from(config)),
        )?;
        Ok(created.id.into())
    }

    fn generate(&self, req: &NumberRequest) -> ServiceResult<NumberSequence> {
        let url = self.url(&["exercises", req.exercise_id.as_str(), "generate"]);
        self.json(self.client.post(url).json(req))
    }
}

impl AnswerValidator for ApiClient {
    fn validate(&self, req: &ValidationRequest) -> ServiceResult<ValidationResponse> {
        let url = self.url(&["exercises", req.exercise_id.as_str(), "validate"]);
        self.json(self.client.post(url).json(req))
    }
}

impl AttemptRecorder for ApiClient {
    fn create(&self, attempt: &NewAttempt) -> ServiceResult<String> {
        let created: Created = self.json(self.client.post(self.url(&["attempts"])).json(attempt))?;
        Ok(created.id.into())
    }

    fn update(&self, attempt_id: &str, update: &AttemptUpdate) -> ServiceResult<()> {
        self.send(self.client.patch(self.url(&["attempts", attempt_id])).json(update))?;
        Ok(())
    }
}

impl AchievementSource for ApiClient {
    fn achievements(&self, student_id: &str) -> ServiceResult<Vec<Achievement>> {
        let url = self.url(&["students", student_id, "achievements"]);
        let remote: Vec<RemoteAchievement> = self.json(self.client.get(url))?;
        Ok(remote
            .into_iter()
            .map(|a| Achievement {
                id: a.id.into(),
                title: a.title,
                description: a.description.unwrap_or_default(),
            })
            .collect())
    }
}
