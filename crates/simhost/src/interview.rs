//! Interview requests against a running worker.
//!
//! Three shapes: a single agent, a batch of heterogeneous requests, and a
//! broadcast of one prompt to every agent. A worker may drive several channels
//! (platforms); a request that names none is fanned out to all of them and
//! the answers are merged into one map keyed by channel.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::ipc::{CommandType, IpcClient, IpcError};

#[derive(Debug, Clone, Copy)]
pub struct InterviewTimeouts {
    pub single: Duration,
    pub batch: Duration,
    pub broadcast: Duration,
    pub close: Duration,
}

impl Default for InterviewTimeouts {
    fn default() -> Self {
        Self {
            single: Duration::from_secs(60),
            batch: Duration::from_secs(120),
            broadcast: Duration::from_secs(180),
            close: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewRequest {
    pub agent_id: u64,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl InterviewRequest {
    pub fn new(agent_id: u64, prompt: impl Into<String>) -> Self {
        Self {
            agent_id,
            prompt: prompt.into(),
            platform: None,
        }
    }

    pub fn on(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }
}

/// Merged answer to a batch or broadcast.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub interviews_count: usize,
    /// Keyed `"{platform}_{agent_id}"`.
    pub results: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CloseOutcome {
    Closed { result: serde_json::Value },
    /// The worker had no live environment to close.
    AlreadyClosed,
    /// No answer before the timeout; the worker may still be shutting down.
    Closing,
}

pub struct InterviewCoordinator {
    client: IpcClient,
    declared_channels: Vec<String>,
    timeouts: InterviewTimeouts,
}

impl InterviewCoordinator {
    pub fn new(client: IpcClient, declared_channels: Vec<String>) -> Self {
        Self {
            client,
            declared_channels,
            timeouts: InterviewTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: InterviewTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn client(&self) -> &IpcClient {
        &self.client
    }

    /// Channels the worker currently serves, falling back to the declared ones.
    pub fn channels(&self) -> Vec<String> {
        let available = self
            .client
            .heartbeat()
            .map(|h| h.available_channels())
            .unwrap_or_default();
        if available.is_empty() {
            self.declared_channels.clone()
        } else {
            available
        }
    }

    /// Interview one agent. Without a platform, every channel is asked and the
    /// answers are merged under `platforms`.
    pub async fn interview(
        &self,
        agent_id: u64,
        prompt: &str,
        platform: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, IpcError> {
        let timeout = timeout.unwrap_or(self.timeouts.single);
        let channels = match platform {
            Some(platform) => vec![platform.to_string()],
            None => self.channels(),
        };

        if channels.len() <= 1 {
            let request = InterviewRequest {
                agent_id,
                prompt: prompt.to_string(),
                platform: channels.into_iter().next(),
            };
            return self.send_single(&request, timeout).await;
        }

        tracing::debug!(agent_id, channels = ?channels, "Fanning interview out across channels");
        let requests: Vec<InterviewRequest> = channels
            .iter()
            .map(|c| InterviewRequest::new(agent_id, prompt).on(c.clone()))
            .collect();
        let answers = join_all(requests.iter().map(|r| self.send_single(r, timeout))).await;

        let mut platforms = serde_json::Map::new();
        let mut errors = Vec::new();
        for (channel, answer) in channels.into_iter().zip(answers) {
            match answer {
                Ok(result) => {
                    platforms.insert(channel, result);
                }
                Err(e) => {
                    platforms.insert(
                        channel.clone(),
                        serde_json::json!({"success": false, "error": e.to_string()}),
                    );
                    errors.push((channel, e));
                }
            }
        }

        if errors.len() == platforms.len() {
            return Err(merge_errors(errors));
        }

        Ok(serde_json::json!({
            "agent_id": agent_id,
            "prompt": prompt,
            "platforms": platforms,
        }))
    }

    async fn send_single(
        &self,
        request: &InterviewRequest,
        timeout: Duration,
    ) -> Result<serde_json::Value, IpcError> {
        let args = serde_json::to_value(request).map_err(|e| IpcError::Protocol(e.to_string()))?;
        self.client
            .request(CommandType::Interview, args, timeout)
            .await
    }

    /// Interview several agents in one command. Requests without a platform are
    /// expanded to one request per channel.
    pub async fn interview_batch(
        &self,
        requests: Vec<InterviewRequest>,
        timeout: Option<Duration>,
    ) -> Result<BatchOutcome, IpcError> {
        let timeout = timeout.unwrap_or(self.timeouts.batch);
        let interviews = expand_requests(requests, &self.channels());
        let args = serde_json::json!({ "interviews": interviews });
        let result = self
            .client
            .request(CommandType::BatchInterview, args, timeout)
            .await?;
        Ok(parse_batch(result, interviews.len()))
    }

    /// One prompt to every listed agent, sent as a single batch.
    pub async fn interview_all(
        &self,
        agent_ids: &[u64],
        prompt: &str,
        platform: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<BatchOutcome, IpcError> {
        let requests = agent_ids
            .iter()
            .map(|id| InterviewRequest {
                agent_id: *id,
                prompt: prompt.to_string(),
                platform: platform.map(str::to_string),
            })
            .collect();
        tracing::info!(agents = agent_ids.len(), "Broadcasting interview");
        self.interview_batch(requests, Some(timeout.unwrap_or(self.timeouts.broadcast)))
            .await
    }

    /// Ask the worker to shut its environment down.
    pub async fn close_env(&self, timeout: Option<Duration>) -> Result<CloseOutcome, IpcError> {
        let timeout = timeout.unwrap_or(self.timeouts.close);
        match self
            .client
            .request(CommandType::CloseEnv, serde_json::json!({}), timeout)
            .await
        {
            Ok(result) => Ok(CloseOutcome::Closed { result }),
            Err(IpcError::EnvironmentNotAlive) => Ok(CloseOutcome::AlreadyClosed),
            Err(IpcError::Timeout { .. }) => {
                tracing::warn!(?timeout, "close_env unanswered, environment may still be closing");
                Ok(CloseOutcome::Closing)
            }
            Err(e) => Err(e),
        }
    }
}

fn expand_requests(requests: Vec<InterviewRequest>, channels: &[String]) -> Vec<InterviewRequest> {
    let mut expanded = Vec::with_capacity(requests.len() * channels.len().max(1));
    for request in requests {
        match (request.platform.is_some(), channels) {
            (true, _) | (false, []) => expanded.push(request),
            (false, channels) => {
                for channel in channels {
                    expanded.push(request.clone().on(channel.clone()));
                }
            }
        }
    }
    expanded
}

fn parse_batch(result: serde_json::Value, sent: usize) -> BatchOutcome {
    let results: BTreeMap<String, serde_json::Value> = result
        .get("results")
        .and_then(|r| r.as_object())
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let interviews_count = result
        .get("interviews_count")
        .and_then(|c| c.as_u64())
        .map(|c| c as usize)
        .unwrap_or(sent);
    BatchOutcome {
        interviews_count,
        results,
    }
}

fn merge_errors(mut errors: Vec<(String, IpcError)>) -> IpcError {
    if errors.iter().all(|(_, e)| e.is_timeout()) {
        return errors.swap_remove(0).1;
    }
    let detail = errors
        .iter()
        .map(|(channel, e)| format!("{channel}: {e}"))
        .collect::<Vec<_>>()
        .join("; ");
    let command_id = errors
        .into_iter()
        .find_map(|(_, e)| match e {
            IpcError::Failed { command_id, .. } => Some(command_id),
            _ => None,
        })
        .unwrap_or_default();
    IpcError::Failed {
        command_id,
        error: format!("interview failed on every channel: {detail}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ipc::{ChannelServer, ChannelTransport, IpcResponse};

    /// Worker stand-in: answers interviews per platform, fails agent 99.
    fn serve(mut server: ChannelServer) -> tokio::task::JoinHandle<Vec<serde_json::Value>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(pending) = server.recv().await {
                let command = pending.command.clone();
                seen.push(serde_json::json!({
                    "type": command.command_type.as_str(),
                    "args": command.args,
                }));
                let response = match command.command_type {
                    CommandType::Interview => {
                        let agent = command.args["agent_id"].as_u64().unwrap_or_default();
                        let platform = command.args["platform"].as_str().unwrap_or("none");
                        if agent == 99 {
                            IpcResponse::failed(&command.command_id, format!("agent 99 missing on {platform}"))
                        } else {
                            IpcResponse::completed(
                                &command.command_id,
                                serde_json::json!({"platform": platform, "response": format!("hi from {agent}")}),
                            )
                        }
                    }
                    CommandType::BatchInterview => {
                        let interviews = command.args["interviews"].as_array().cloned().unwrap_or_default();
                        let mut results = serde_json::Map::new();
                        for item in &interviews {
                            let key = format!(
                                "{}_{}",
                                item["platform"].as_str().unwrap_or("none"),
                                item["agent_id"]
                            );
                            results.insert(key, serde_json::json!({"prompt": item["prompt"]}));
                        }
                        IpcResponse::completed(
                            &command.command_id,
                            serde_json::json!({"interviews_count": interviews.len(), "results": results}),
                        )
                    }
                    CommandType::CloseEnv => {
                        IpcResponse::completed(&command.command_id, serde_json::json!({"message": "closing"}))
                    }
                };
                pending.respond(response);
            }
            seen
        })
    }

    fn coordinator(channels: &[&str]) -> (InterviewCoordinator, ChannelServer) {
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let (transport, server) = ChannelTransport::pair(channels.clone());
        server.start();
        let client = IpcClient::new(Arc::new(transport));
        (InterviewCoordinator::new(client, channels), server)
    }

    #[tokio::test]
    async fn pinned_interview_sends_one_command() {
        let (coordinator, server) = coordinator(&["twitter", "reddit"]);
        let worker = serve(server);

        let result = coordinator
            .interview(7, "x", Some("reddit"), None)
            .await
            .unwrap();
        assert_eq!(result["platform"], "reddit");

        drop(coordinator);
        let seen = worker.await.unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn unqualified_interview_merges_channels() {
        let (coordinator, server) = coordinator(&["twitter", "reddit"]);
        let worker = serve(server);

        let result = coordinator.interview(7, "x", None, None).await.unwrap();
        insta::assert_json_snapshot!(result, @r#"
        {
          "agent_id": 7,
          "platforms": {
            "reddit": {
              "platform": "reddit",
              "response": "hi from 7"
            },
            "twitter": {
              "platform": "twitter",
              "response": "hi from 7"
            }
          },
          "prompt": "x"
        }
        "#);

        drop(coordinator);
        assert_eq!(worker.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn all_channels_failing_is_a_failure() {
        let (coordinator, server) = coordinator(&["twitter", "reddit"]);
        let _worker = serve(server);

        let err = coordinator.interview(99, "x", None, None).await.unwrap_err();
        match err {
            IpcError::Failed { error, .. } => {
                assert!(error.contains("twitter"));
                assert!(error.contains("reddit"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_expands_unqualified_items() {
        let (coordinator, server) = coordinator(&["twitter", "reddit"]);
        let worker = serve(server);

        let outcome = coordinator
            .interview_batch(
                vec![
                    InterviewRequest::new(1, "a").on("twitter"),
                    InterviewRequest::new(2, "b"),
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.interviews_count, 3);
        let keys: Vec<&str> = outcome.results.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["reddit_2", "twitter_1", "twitter_2"]);

        drop(coordinator);
        let seen = worker.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["type"], "batch_interview");
    }

    #[tokio::test]
    async fn broadcast_is_one_batch() {
        let (coordinator, server) = coordinator(&["twitter"]);
        let worker = serve(server);

        let outcome = coordinator
            .interview_all(&[1, 2, 3], "how are you?", None, None)
            .await
            .unwrap();
        assert_eq!(outcome.interviews_count, 3);
        assert_eq!(outcome.results["twitter_3"]["prompt"], "how are you?");

        drop(coordinator);
        assert_eq!(worker.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timeout_is_not_failure() {
        let (coordinator, server) = coordinator(&["twitter"]);
        // Server is alive but never answers.
        let err = coordinator
            .interview(7, "x", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        drop(server);
    }

    #[tokio::test]
    async fn close_env_outcomes() {
        let (coordinator, server) = coordinator(&["twitter"]);
        let stopped = {
            server.stop();
            coordinator.close_env(None).await.unwrap()
        };
        assert_eq!(stopped, CloseOutcome::AlreadyClosed);

        server.start();
        let closing = coordinator
            .close_env(Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(closing, CloseOutcome::Closing);

        let _worker = serve(server);
        let closed = coordinator.close_env(None).await.unwrap();
        assert!(matches!(closed, CloseOutcome::Closed { .. }));
    }

    #[test]
    fn expansion_without_channels_keeps_requests() {
        let expanded = expand_requests(vec![InterviewRequest::new(1, "a")], &[]);
        assert_eq!(expanded, vec![InterviewRequest::new(1, "a")]);
    }
}
