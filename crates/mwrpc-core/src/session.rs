//! Connect handshake and authentication.
//!
//! A connection becomes usable in four steps, each fatal to the attempt:
//!
//! 1. open the transport through the [`Connector`]
//! 2. send a connect frame naming the protocol version
//! 3. read one frame; it must say `connected` and carry a non-empty session id
//! 4. with credentials, log in through the normal call path and require a
//!    literal `true`
//!
//! Without credentials the session is Ready right after step 3.

use crate::config::{ClientOptions, ProtocolConfig};
use crate::context::Context;
use crate::dispatcher::Dispatcher;
use crate::envelope::{ConnectReply, ConnectRequest};
use crate::error::{Result, RpcError};
use crate::transport::{Connection, Connector};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// How the client proves its identity after the handshake.
#[derive(Clone, Default)]
pub enum Credentials {
    #[default]
    None,
    Password {
        username: String,
        password: String,
    },
    ApiKey(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => write!(f, "None"),
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::ApiKey(_) => write!(f, "ApiKey(<redacted>)"),
        }
    }
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Credentials::ApiKey(key.into())
    }

    /// The login method and its params, or `None` when no login is needed.
    fn login_call(&self) -> Option<(&'static str, Vec<Value>)> {
        match self {
            Credentials::None => None,
            Credentials::Password { username, password } => Some((
                ProtocolConfig::LOGIN_METHOD,
                vec![json!(username), json!(password)],
            )),
            Credentials::ApiKey(key) => {
                Some((ProtocolConfig::API_KEY_LOGIN_METHOD, vec![json!(key)]))
            }
        }
    }
}

/// Send the connect frame and validate the reply.
pub(crate) async fn handshake(connection: &mut Connection) -> Result<String> {
    let hello = serde_json::to_vec(&ConnectRequest::new())?;
    connection.sink.send(hello).await?;

    let frame = connection
        .source
        .recv()
        .await?
        .ok_or_else(|| RpcError::Handshake {
            message: "connection closed before the server replied".to_string(),
        })?;

    let reply: ConnectReply = serde_json::from_slice(&frame).map_err(|e| RpcError::Handshake {
        message: format!("unreadable reply: {}", e),
    })?;
    reply.into_session()
}

/// Establishes sessions on behalf of the client and the reconnector.
pub struct SessionManager {
    dispatcher: Arc<Dispatcher>,
    connector: Arc<dyn Connector>,
    options: ClientOptions,
}

impl SessionManager {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        connector: Arc<dyn Connector>,
        options: ClientOptions,
    ) -> Self {
        Self {
            dispatcher,
            connector,
            options,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Run one full connect attempt. On failure the dispatcher is left
    /// Disconnected (or Closing, if the client was closed meanwhile).
    pub async fn establish(&self) -> Result<()> {
        self.dispatcher.begin_attempt()?;

        let result = self.try_establish().await;
        if let Err(e) = &result {
            debug!("Connect attempt to {} failed: {}", self.connector.address(), e);
            self.dispatcher.abandon_attempt(&e.to_string());
        }
        result
    }

    async fn try_establish(&self) -> Result<()> {
        let address = self.connector.address();
        let mut connection = self.connector.open().await?;

        let session_id =
            tokio::time::timeout(self.options.handshake_timeout, handshake(&mut connection))
                .await
                .map_err(|_| RpcError::Handshake {
                    message: format!(
                        "no reply within {:?}",
                        self.options.handshake_timeout
                    ),
                })??;
        debug!("Handshake with {} complete, session {}", address, session_id);

        let login = self.options.credentials.login_call();
        let generation = self
            .dispatcher
            .attach(connection, session_id.clone(), login.is_some())?;

        if let Some((method, params)) = login {
            let ctx = Context::background().with_timeout(self.options.handshake_timeout);
            match self.dispatcher.call_in_session(&ctx, method, params).await {
                Ok(Value::Bool(true)) => {}
                Ok(other) => {
                    return Err(RpcError::AuthenticationRejected {
                        message: format!("{} returned {}", method, other),
                    })
                }
                Err(RpcError::Remote(desc)) => {
                    return Err(RpcError::AuthenticationRejected {
                        message: desc.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
            self.dispatcher.mark_ready(generation)?;
        }

        info!("Session {} ready on {}", session_id, address);
        Ok(())
    }
}
