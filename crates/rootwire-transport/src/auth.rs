//! Authentication negotiation.
//!
//! After login the server may hand the client a parameter string listing the
//! mechanisms it accepts (`&P=<name>[,args]` entries). An [`AuthSession`]
//! walks those candidates through an [`AuthProviderRegistry`], exchanging
//! challenge/response rounds with the server until one mechanism is accepted
//! or every candidate has been rejected.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::codec::{ResponseBody, ServerResponse};
use crate::error::{Result, TransportError};

/// Key/value hints handed to providers while they compute credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthEnv {
    vars: BTreeMap<String, String>,
}

impl AuthEnv {
/// Empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the environment for one negotiation: socket name, URL user
    /// and password, and every URL parameter in the `xrd.`/`xrdcl.` space.
    pub fn for_login(
        sockname: &str,
        username: &str,
        password: &str,
        params: &BTreeMap<String, String>,
    ) -> Self {
        let mut env = Self::new();
        env.put("sockname", sockname);
        env.put("username", username);
        env.put("password", password);
        for (key, value) in params {
            if key.starts_with("xrd.") || key.starts_with("xrdcl.") {
                env.put(key, value);
            }
        }
        env
    }

/// Sets `key`, replacing any previous value.
    pub fn put(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

/// Value of `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// One authentication mechanism instance, alive for one negotiation.
pub trait AuthProvider: Send {
    /// Short mechanism name; only the first 4 bytes go on the wire.
    fn mechanism_name(&self) -> &str;

    /// Credentials for the initial round (`challenge == None`) or in answer
    /// to a server challenge. `None` means the provider refuses.
    fn get_credentials(&mut self, challenge: Option<&[u8]>, env: &AuthEnv) -> Option<Bytes>;
}

/// What a registry gets to pick the next provider.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
/// Host name from the channel URL.
    pub host: &'a str,
/// Resolved server address, when known.
    pub peer_addr: Option<SocketAddr>,
    /// Security parameters from the login response.
    pub params: &'a [u8],
    /// Mechanisms already attempted in this negotiation.
    pub tried: &'a [String],
}

/// Source of authentication providers, shared by every channel.
pub trait AuthProviderRegistry: Send + Sync {
    /// Next untried provider acceptable to the server, if any is left.
    fn resolve(&self, request: &ResolveRequest<'_>) -> Option<Box<dyn AuthProvider>>;
}

/// Splits a security parameter string into `(mechanism, args)` pairs in
/// server order.
pub fn parse_mechanisms(params: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(params);
    let text = text.trim_end_matches('\0');
    text.split("&P=")
        .skip(1)
        .filter_map(|entry| {
            let (name, args) = entry.split_once(',').unwrap_or((entry, ""));
            let name = name.trim();
            if name.is_empty() {
                None
            } else {
                Some((name.to_string(), args.trim().to_string()))
            }
        })
        .collect()
}

type ProviderFactory = Arc<dyn Fn(&str) -> Box<dyn AuthProvider> + Send + Sync>;

/// In-process registry of named provider factories.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry")
            .field("mechanisms", &names)
            .finish()
    }
}

impl ProviderRegistry {
    /// Empty registry; every negotiation fails until factories are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `host` and `unix` providers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("host", |_| Box::new(HostProvider));
        registry.register("unix", |_| Box::new(UnixProvider));
        registry
    }

    /// Adds a factory; it receives the server supplied arguments.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&str) -> Box<dyn AuthProvider> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }
}

impl AuthProviderRegistry for ProviderRegistry {
    fn resolve(&self, request: &ResolveRequest<'_>) -> Option<Box<dyn AuthProvider>> {
        parse_mechanisms(request.params)
            .into_iter()
            .filter(|(name, _)| !request.tried.iter().any(|t| t == name))
            .find_map(|(name, args)| {
                let factory = self.factories.get(&name);
                if factory.is_none() {
                    debug!(host = request.host, mechanism = %name, "no provider for mechanism");
                }
                factory.map(|f| f(&args))
            })
    }
}

/// Host based mechanism; the server trusts the peer address.
#[derive(Debug, Default)]
pub struct HostProvider;

impl AuthProvider for HostProvider {
    fn mechanism_name(&self) -> &str {
        "host"
    }

    fn get_credentials(&mut self, _challenge: Option<&[u8]>, _env: &AuthEnv) -> Option<Bytes> {
        Some(Bytes::new())
    }
}

/// Sends the user and group names in clear.
#[derive(Debug, Default)]
pub struct UnixProvider;

impl AuthProvider for UnixProvider {
    fn mechanism_name(&self) -> &str {
        "unix"
    }

    fn get_credentials(&mut self, challenge: Option<&[u8]>, env: &AuthEnv) -> Option<Bytes> {
        if challenge.is_some() {
            return None;
        }
        let user = env
            .get("username")
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "nobody".to_string());
        let group = env.get("xrdcl.secgid").unwrap_or("nogroup");
        Some(Bytes::from(format!("unix\0{} {}", user, group)))
    }
}

/// Result of one negotiation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send these credentials in an auth request.
    Send {
        /// Mechanism the credentials belong to.
        mechanism: String,
        /// Payload of the auth request.
        credentials: Bytes,
    },
    /// The server accepted the mechanism.
    Accepted {
        /// Mechanism the server accepted.
        mechanism: String,
    },
}

/// State of one negotiation, from the first credentials to the verdict.
///
/// Dropping the session releases the provider and environment, so every
/// exit path cleans up.
pub struct AuthSession {
    stream: String,
    host: String,
    peer_addr: Option<SocketAddr>,
    params: Bytes,
    env: AuthEnv,
    provider: Option<Box<dyn AuthProvider>>,
    tried: Vec<String>,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("stream", &self.stream)
            .field("host", &self.host)
            .field("mechanism", &self.mechanism())
            .field("tried", &self.tried)
            .finish()
    }
}

fn auth_failed(reason: impl Into<String>) -> TransportError {
    TransportError::AuthFailed {
        reason: reason.into(),
    }
}

impl AuthSession {
/// Starts a negotiation over the login response's security parameters.
    pub fn new(
        stream: &str,
        host: &str,
        peer_addr: Option<SocketAddr>,
        params: Bytes,
        env: AuthEnv,
    ) -> Self {
        Self {
            stream: stream.to_string(),
            host: host.to_string(),
            peer_addr,
            params,
            env,
            provider: None,
            tried: Vec::new(),
        }
    }

    /// Security parameters received at login.
    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// Mechanisms attempted so far, in order.
    pub fn tried(&self) -> &[String] {
        &self.tried
    }

    /// Mechanism currently in use.
    pub fn mechanism(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.mechanism_name())
    }

    /// Picks the first provider that yields credentials.
    pub fn start(&mut self, registry: &dyn AuthProviderRegistry) -> Result<AuthStep> {
        debug!(stream = %self.stream, "sending authentication data");
        self.next_provider(registry)
    }

    fn next_provider(&mut self, registry: &dyn AuthProviderRegistry) -> Result<AuthStep> {
        self.provider = None;
        loop {
            let request = ResolveRequest {
                host: &self.host,
                peer_addr: self.peer_addr,
                params: &self.params,
                tried: &self.tried,
            };
            let Some(mut provider) = registry.resolve(&request) else {
                error!(stream = %self.stream, "no protocols left to try");
                return Err(auth_failed("No protocols left to try"));
            };

            let name = provider.mechanism_name().to_string();
            if self.tried.contains(&name) {
                error!(stream = %self.stream, mechanism = %name, "registry offered a mechanism twice");
                return Err(auth_failed(format!("mechanism {} offered twice", name)));
            }
            self.tried.push(name.clone());
            debug!(stream = %self.stream, mechanism = %name, "trying to authenticate");

            match provider.get_credentials(None, &self.env) {
                Some(credentials) => {
                    self.provider = Some(provider);
                    return Ok(AuthStep::Send {
                        mechanism: name,
                        credentials,
                    });
                }
                None => {
                    debug!(stream = %self.stream, mechanism = %name, "cannot get credentials");
                }
            }
        }
    }

    /// Processes the server reply to the last auth request.
    pub fn handle_reply(
        &mut self,
        response: &ServerResponse,
        registry: &dyn AuthProviderRegistry,
    ) -> Result<AuthStep> {
        let Some(provider) = self.provider.as_mut() else {
            return Err(TransportError::Internal {
                reason: "authentication reply without an active provider".to_string(),
            });
        };
        let name = provider.mechanism_name().to_string();

        match &response.body {
            ResponseBody::AuthMore(challenge) => {
                debug!(stream = %self.stream, mechanism = %name, "sending more authentication data");
                match provider.get_credentials(Some(challenge.as_ref()), &self.env) {
                    Some(credentials) => Ok(AuthStep::Send {
                        mechanism: name,
                        credentials,
                    }),
                    None => {
                        error!(
                            stream = %self.stream,
                            mechanism = %name,
                            "provider refuses to give more credentials"
                        );
                        self.provider = None;
                        Err(auth_failed(format!(
                            "{} refuses to give more credentials",
                            name
                        )))
                    }
                }
            }
            ResponseBody::Ok(_) => {
                debug!(stream = %self.stream, mechanism = %name, "authenticated");
                self.provider = None;
                Ok(AuthStep::Accepted { mechanism: name })
            }
            ResponseBody::Error { errnum, message } => {
                warn!(
                    stream = %self.stream,
                    mechanism = %name,
                    errnum = errnum,
                    "authentication failed: {}",
                    message
                );
                self.next_provider(registry)
            }
            _ => {
                error!(stream = %self.stream, mechanism = %name, "unexpected authentication answer");
                self.provider = None;
                Err(auth_failed("Authentication failed: unexpected answer."))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Provider that answers every round with a fixed token.
    pub(crate) struct ScriptedProvider {
        pub(crate) name: String,
        pub(crate) refuse_initial: bool,
    }

    impl AuthProvider for ScriptedProvider {
        fn mechanism_name(&self) -> &str {
            &self.name
        }

        fn get_credentials(&mut self, challenge: Option<&[u8]>, _env: &AuthEnv) -> Option<Bytes> {
            if challenge.is_none() && self.refuse_initial {
                return None;
            }
            let mut token = self.name.as_bytes().to_vec();
            if let Some(c) = challenge {
                token.extend_from_slice(c);
            }
            Some(Bytes::from(token))
        }
    }

    /// Registry that records every request and offers providers in order.
    #[derive(Default)]
    pub(crate) struct RecordingRegistry {
        pub(crate) names: Vec<(String, bool)>,
        pub(crate) seen_params: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingRegistry {
        pub(crate) fn with(names: &[&str]) -> Self {
            Self {
                names: names.iter().map(|n| (n.to_string(), false)).collect(),
                seen_params: Mutex::new(Vec::new()),
            }
        }
    }

    impl AuthProviderRegistry for RecordingRegistry {
        fn resolve(&self, request: &ResolveRequest<'_>) -> Option<Box<dyn AuthProvider>> {
            self.seen_params.lock().unwrap().push(request.params.to_vec());
            self.names
                .iter()
                .find(|(n, _)| !request.tried.contains(n))
                .map(|(n, refuse)| {
                    Box::new(ScriptedProvider {
                        name: n.clone(),
                        refuse_initial: *refuse,
                    }) as Box<dyn AuthProvider>
                })
        }
    }

    fn session(params: &str) -> AuthSession {
        AuthSession::new(
            "[test:1094.0]",
            "test",
            None,
            Bytes::copy_from_slice(params.as_bytes()),
            AuthEnv::new(),
        )
    }

    fn reply(body: ResponseBody) -> ServerResponse {
        ServerResponse::new([0, 0], body)
    }

    fn rejection() -> ServerResponse {
        reply(ResponseBody::Error {
            errnum: 3010,
            message: "denied".to_string(),
        })
    }

    #[test]
    fn test_parse_mechanisms() {
        let parsed = parse_mechanisms(b"&P=krb5,xrootd/host@REALM&P=unix&P=host\0");
        assert_eq!(
            parsed,
            vec![
                ("krb5".to_string(), "xrootd/host@REALM".to_string()),
                ("unix".to_string(), String::new()),
                ("host".to_string(), String::new()),
            ]
        );
        assert!(parse_mechanisms(b"").is_empty());
    }

    #[test]
    fn test_builtin_registry_skips_unknown_and_tried() {
        let registry = ProviderRegistry::with_builtins();
        let tried = vec!["unix".to_string()];
        let request = ResolveRequest {
            host: "srv",
            peer_addr: None,
            params: b"&P=gsi,v:1&P=unix&P=host",
            tried: &tried,
        };
        let provider = registry.resolve(&request).unwrap();
        assert_eq!(provider.mechanism_name(), "host");
    }

    #[test]
    fn test_unix_credentials() {
        let mut env = AuthEnv::new();
        env.put("username", "alice");
        env.put("xrdcl.secgid", "users");
        let creds = UnixProvider.get_credentials(None, &env).unwrap();
        assert_eq!(creds.as_ref(), b"unix\0alice users");
    }

    #[test]
    fn test_auth_env_filters_params() {
        let params: BTreeMap<String, String> = [
            ("xrd.wantprot", "unix"),
            ("xrdcl.secuid", "1000"),
            ("other", "x"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let env = AuthEnv::for_login("10.0.0.1:5000", "bob", "", &params);
        assert_eq!(env.get("sockname"), Some("10.0.0.1:5000"));
        assert_eq!(env.get("username"), Some("bob"));
        assert_eq!(env.get("xrd.wantprot"), Some("unix"));
        assert_eq!(env.get("xrdcl.secuid"), Some("1000"));
        assert_eq!(env.get("other"), None);
    }

    #[test]
    fn test_authmore_uses_same_provider() {
        let registry = RecordingRegistry::with(&["gsi"]);
        let mut session = session("&P=gsi");
        let step = session.start(&registry).unwrap();
        assert_eq!(
            step,
            AuthStep::Send {
                mechanism: "gsi".to_string(),
                credentials: Bytes::from_static(b"gsi"),
            }
        );

        let step = session
            .handle_reply(&reply(ResponseBody::AuthMore(Bytes::from_static(b"!c"))), &registry)
            .unwrap();
        assert_eq!(
            step,
            AuthStep::Send {
                mechanism: "gsi".to_string(),
                credentials: Bytes::from_static(b"gsi!c"),
            }
        );
        assert_eq!(session.tried(), &["gsi".to_string()]);

        let step = session
            .handle_reply(&reply(ResponseBody::Ok(Bytes::new())), &registry)
            .unwrap();
        assert_eq!(
            step,
            AuthStep::Accepted {
                mechanism: "gsi".to_string()
            }
        );
        assert_eq!(session.mechanism(), None);
    }

    #[test]
    fn test_all_rejected_terminates_after_n_attempts() {
        let registry = RecordingRegistry::with(&["a", "b", "c"]);
        let mut session = session("&P=a&P=b&P=c");
        let mut attempts = 0;
        let mut step = session.start(&registry);
        loop {
            match step {
                Ok(AuthStep::Send { .. }) => {
                    attempts += 1;
                    step = session.handle_reply(&rejection(), &registry);
                }
                Ok(AuthStep::Accepted { .. }) => panic!("nothing should be accepted"),
                Err(err) => {
                    assert!(matches!(err, TransportError::AuthFailed { .. }));
                    assert!(err.is_fatal());
                    break;
                }
            }
        }
        assert_eq!(attempts, 3);
        assert_eq!(session.tried().len(), 3);
    }

    #[test]
    fn test_refusing_provider_is_skipped() {
        let mut registry = RecordingRegistry::with(&["a", "b"]);
        registry.names[0].1 = true;
        let mut session = session("&P=a&P=b");
        let step = session.start(&registry).unwrap();
        assert!(matches!(step, AuthStep::Send { ref mechanism, .. } if mechanism == "b"));
    }

    #[test]
    fn test_unexpected_status_is_fatal() {
        let registry = RecordingRegistry::with(&["a"]);
        let mut session = session("&P=a");
        session.start(&registry).unwrap();
        let err = session
            .handle_reply(&reply(ResponseBody::WaitResp { seconds: 1 }), &registry)
            .unwrap_err();
        assert!(matches!(err, TransportError::AuthFailed { .. }));
    }

    #[test]
    fn test_reply_without_provider_is_internal_error() {
        let registry = RecordingRegistry::with(&[]);
        let mut session = session("");
        assert!(session.start(&registry).is_err());
        assert!(matches!(
            session.handle_reply(&rejection(), &registry),
            Err(TransportError::Internal { .. })
        ));
    }
}
