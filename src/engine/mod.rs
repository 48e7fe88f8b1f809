//! The topic-based work engine.
//!
//! Jobs publish [`JobMsg`]s onto a per-method topic; every subscriber
//! attached to that topic observes every message, in the order the job
//! published them. Channels are minimally buffered, so a slow subscriber
//! backpressures the jobs on its topic rather than letting state updates
//! pile up unseen.

pub mod jobs;
pub mod subscriber;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bundle::types::{ExtractedCredentials, JobMethod, JobState};

/// One state update flowing from a job to the subscribers of its topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMsg {
    pub instance_id: Uuid,
    #[serde(default)]
    pub binding_id: Option<Uuid>,
    pub job_token: String,
    pub spec_id: String,
    #[serde(default)]
    pub pod_name: String,
    pub state: JobState,
    #[serde(default)]
    pub extracted_credentials: Option<ExtractedCredentials>,
    #[serde(default)]
    pub dashboard_url: Option<String>,
}

/// A unit of work the engine runs on its own task. The job owns the
/// producer side of its topic for the duration of the run.
#[async_trait]
pub trait Work: Send + 'static {
    async fn run(self: Box<Self>, token: String, tx: mpsc::Sender<JobMsg>);
}

/// Consumes every message published on one topic.
#[async_trait]
pub trait WorkSubscriber: Send + Sync + 'static {
    async fn notify(&self, msg: JobMsg);
}

struct Topic {
    producer: mpsc::Sender<JobMsg>,
    subscribers: Arc<RwLock<Vec<mpsc::Sender<JobMsg>>>>,
}

/// Registry of job topics, one per [`JobMethod`]. Topics are created lazily
/// on first use; the method enum keeps unknown topics unrepresentable.
pub struct WorkEngine {
    topics: RwLock<HashMap<JobMethod, Topic>>,
}

impl Default for WorkEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkEngine {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Starts `work` on the topic for `method` and returns the job token.
    /// A fresh token is generated when the caller does not supply one.
    pub async fn start_job(
        &self,
        token: Option<String>,
        work: Box<dyn Work>,
        method: JobMethod,
    ) -> String {
        let token = token.unwrap_or_else(|| Uuid::new_v4().to_string());
        let producer = self.topic_producer(method).await;
        debug!(token = %token, topic = %method, "starting job");
        tokio::spawn(work.run(token.clone(), producer));
        token
    }

    /// Attaches a subscriber to the topic for `method`. The subscriber is
    /// driven by its own task and stops when the engine is dropped.
    pub async fn attach_subscriber(
        &self,
        subscriber: Arc<dyn WorkSubscriber>,
        method: JobMethod,
    ) {
        // Ensure the topic and its router exist before registering.
        self.topic_producer(method).await;
        let (tx, mut rx) = mpsc::channel::<JobMsg>(1);
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(&method) {
                topic.subscribers.write().await.push(tx);
            }
        }
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                subscriber.notify(msg).await;
            }
            debug!(topic = %method, "subscriber stopped");
        });
    }

    /// Producer handle for a topic, creating the topic and its fan-out
    /// router on first use. Creation takes the write lock so concurrent
    /// first-use is serialized.
    async fn topic_producer(&self, method: JobMethod) -> mpsc::Sender<JobMsg> {
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(&method) {
                return topic.producer.clone();
            }
        }

        let mut topics = self.topics.write().await;
        if let Some(topic) = topics.get(&method) {
            return topic.producer.clone();
        }

        let (producer, receiver) = mpsc::channel::<JobMsg>(1);
        let subscribers: Arc<RwLock<Vec<mpsc::Sender<JobMsg>>>> = Arc::default();
        tokio::spawn(route(method, receiver, Arc::clone(&subscribers)));
        topics.insert(
            method,
            Topic {
                producer: producer.clone(),
                subscribers,
            },
        );
        producer
    }
}

/// Fans every message on a topic out to all its subscribers, preserving the
/// order in which jobs published them. Subscribers whose channel has closed
/// are dropped from the list.
async fn route(
    method: JobMethod,
    mut receiver: mpsc::Receiver<JobMsg>,
    subscribers: Arc<RwLock<Vec<mpsc::Sender<JobMsg>>>>,
) {
    while let Some(msg) = receiver.recv().await {
        let targets: Vec<mpsc::Sender<JobMsg>> = subscribers.read().await.clone();
        if targets.is_empty() {
            warn!(topic = %method, token = %msg.job_token, "message published with no subscribers");
            continue;
        }
        let mut closed = false;
        for target in &targets {
            if target.send(msg.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            subscribers.write().await.retain(|s| !s.is_closed());
        }
    }
    debug!(topic = %method, "topic router stopped");
}
