//! Public client handle.
//!
//! [`Client`] ties the pieces together: it runs the initial connect through
//! the [`SessionManager`], then keeps a reconnector (and optionally a
//! keepalive) running until [`Client::close`]. Clones share one session.

use crate::config::{ClientOptions, TimeoutConfig};
use crate::context::Context;
use crate::dispatcher::{ConnectionState, Dispatcher};
use crate::envelope::Notification;
use crate::error::{Result, RpcError};
use crate::job::{Job, JobProgress, JobRunner};
use crate::reconnect::{self, Reconnector};
use crate::session::SessionManager;
use crate::transport::{Connector, DefaultConnector, Endpoint};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Client session to one backend.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    dispatcher: Arc<Dispatcher>,
    options: ClientOptions,
    shutdown: Context,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.dispatcher.close();
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Client {
    /// Connect to `options.url`, selecting the transport from its scheme.
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        let endpoint = Endpoint::parse(&options.url)?;
        let connector = Arc::new(DefaultConnector::new(
            endpoint,
            options.connect_timeout,
            options.max_message_size,
        ));
        Self::connect_with(connector, options).await
    }

    /// Connect through a caller-supplied connector.
    ///
    /// Makes a single attempt; retries only happen after a Ready session is
    /// lost, and only when `auto_reconnect` is set.
    pub async fn connect_with(connector: Arc<dyn Connector>, options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let dispatcher = Arc::new(Dispatcher::new(options.notification_capacity));
        let session = Arc::new(SessionManager::new(
            Arc::clone(&dispatcher),
            connector,
            options.clone(),
        ));

        if let Err(e) = session.establish().await {
            dispatcher.close();
            return Err(e);
        }

        let shutdown = Context::background();
        let mut tasks = Vec::new();
        if options.auto_reconnect {
            tasks.push(Reconnector::new(Arc::clone(&session), shutdown.clone()).spawn());
        }
        if let Some(interval) = options.keepalive_interval {
            tasks.push(reconnect::spawn_keepalive(
                Arc::clone(&dispatcher),
                interval,
                shutdown.clone(),
            ));
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                dispatcher,
                options,
                shutdown,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    /// Call `method` and return its raw result.
    pub async fn call(&self, ctx: &Context, method: &str, params: Vec<Value>) -> Result<Value> {
        self.inner.dispatcher.call(ctx, method, params).await
    }

    /// Call `method` and decode its result into `T`.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T> {
        let result = self.call(ctx, method, params).await?;
        serde_json::from_value(result).map_err(|e| RpcError::decode(format!("result of {}", method), e))
    }

    /// Call `method` for its side effect only; errors still surface.
    pub async fn call_unit(&self, ctx: &Context, method: &str, params: Vec<Value>) -> Result<()> {
        self.call(ctx, method, params).await.map(|_| ())
    }

    fn jobs(&self) -> JobRunner<'_> {
        JobRunner::new(&self.inner.dispatcher, self.inner.options.job_poll_interval)
    }

    /// Submit a job call and wait for it to finish.
    pub async fn call_job(&self, ctx: &Context, method: &str, params: Vec<Value>) -> Result<Value> {
        self.jobs().call_job(ctx, method, params).await
    }

    /// Submit a job call and decode its result into `T`.
    pub async fn call_job_typed<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T> {
        self.jobs().call_job_typed(ctx, method, params).await
    }

    /// Submit a job call, reporting each progress change to `on_progress`.
    pub async fn call_job_with_progress(
        &self,
        ctx: &Context,
        method: &str,
        params: Vec<Value>,
        on_progress: impl FnMut(&JobProgress),
    ) -> Result<Value> {
        self.jobs()
            .call_job_with_progress(ctx, method, params, on_progress)
            .await
    }

    pub async fn get_job(&self, ctx: &Context, id: i64) -> Result<Job> {
        self.jobs().get_job(ctx, id).await
    }

    pub async fn abort_job(&self, ctx: &Context, id: i64) -> Result<()> {
        self.jobs().abort_job(ctx, id).await
    }

    /// Check that the server answers.
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        reconnect::ping(&self.inner.dispatcher, ctx).await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.dispatcher.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.dispatcher.watch_state()
    }

    /// Session id of the current connection, if one is attached.
    pub fn session_id(&self) -> Option<String> {
        self.inner.dispatcher.session_id()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.dispatcher.pending_calls()
    }

    /// Subscribe to server events (frames that are not call responses).
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.dispatcher.subscribe()
    }

    /// Shut the client down.
    ///
    /// Enters the terminal Closing state, cancels any reconnect attempt, fails
    /// pending calls with `Closed`, and waits a bounded time for background
    /// tasks before aborting them.
    pub async fn close(&self) {
        info!("Closing client");
        self.inner.shutdown.cancel();
        self.inner.dispatcher.close();

        let tasks: Vec<_> = {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for mut task in tasks {
            if tokio::time::timeout(TimeoutConfig::CLOSE_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                debug!("Background task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}
