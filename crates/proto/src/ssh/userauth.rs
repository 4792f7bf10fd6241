//! The `ssh-userauth` service (RFC 4252).
//!
//! Authentication is a method loop: a probe with the `none` method learns
//! the server's allowed methods, then each configured [`AuthMethod`] is
//! tried in order, constrained to what the server currently advertises.
//! `USERAUTH_FAILURE` with `partial_success` set means the method was
//! accepted but another one is also required.
//!
//! Method-specific replies all arrive as message code 60 and are delegated
//! to the method in flight:
//!
//! - `password` retries through SSH_MSG_USERAUTH_PASSWD_CHANGEREQ when a
//!   new-password callback is configured
//! - `publickey` runs the two-phase probe-then-sign flow, signing
//!   `session_id || request` on SSH_MSG_USERAUTH_PK_OK
//! - `keyboard-interactive` answers each SSH_MSG_USERAUTH_INFO_REQUEST
//!   through a prompt callback
//!
//! On success the transport is flagged authenticated (activating delayed
//! compression) and the next service becomes active.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use capstan_platform::{Event, TransportError, TransportResult, UserAuthError, UserAuthResult};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::ssh::buffer::SshBuffer;
use crate::ssh::hostkey::Signer;
use crate::ssh::message::MessageType;
use crate::ssh::service::Service;
use crate::ssh::transport::Transport;

/// Everything a method needs to build its requests.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The user being authenticated.
    pub username: String,
    /// The service to start on success (normally "ssh-connection").
    pub service_name: String,
    /// The transport session identifier, signed by publickey methods.
    pub session_id: Vec<u8>,
}

/// One authentication method strategy.
///
/// `build_request` produces the initial USERAUTH_REQUEST; method-specific
/// replies (code 60) are fed to `handle_reply`, which may produce a
/// continuation packet to send.
pub trait AuthMethod: Send + Sync {
    /// The method name as advertised in name-lists.
    fn name(&self) -> &'static str;

    /// Builds the initial USERAUTH_REQUEST packet.
    fn build_request(&self, ctx: &AuthContext) -> UserAuthResult<SshBuffer>;

    /// Handles a method-specific reply. `Ok(Some(packet))` continues the
    /// exchange; an error fails this method (the loop moves on).
    fn handle_reply(
        &self,
        msg: MessageType,
        buf: &mut SshBuffer,
        ctx: &AuthContext,
    ) -> UserAuthResult<Option<SshBuffer>>;
}

fn request_header(ctx: &AuthContext, method: &str) -> SshBuffer {
    let mut buf = SshBuffer::for_message(MessageType::UserauthRequest);
    buf.put_string(&ctx.username);
    buf.put_string(&ctx.service_name);
    buf.put_string(method);
    buf
}

/// The `none` method, used to probe for allowed methods.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneAuth;

impl AuthMethod for NoneAuth {
    fn name(&self) -> &'static str {
        "none"
    }

    fn build_request(&self, ctx: &AuthContext) -> UserAuthResult<SshBuffer> {
        Ok(request_header(ctx, self.name()))
    }

    fn handle_reply(
        &self,
        _msg: MessageType,
        _buf: &mut SshBuffer,
        _ctx: &AuthContext,
    ) -> UserAuthResult<Option<SshBuffer>> {
        Err(UserAuthError::MethodFailed {
            method: self.name().to_string(),
        })
    }
}

/// Callback prompting for a replacement password after a change request.
pub type PasswordChangeCallback = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// The `password` method (RFC 4252 Section 8).
pub struct PasswordAuth {
    password: String,
    change_callback: Option<PasswordChangeCallback>,
}

impl PasswordAuth {
    /// Creates a password method.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            change_callback: None,
        }
    }

    /// Installs a callback invoked on SSH_MSG_USERAUTH_PASSWD_CHANGEREQ;
    /// returning `None` aborts the method.
    pub fn with_change_callback(mut self, callback: PasswordChangeCallback) -> Self {
        self.change_callback = Some(callback);
        self
    }
}

impl Drop for PasswordAuth {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl AuthMethod for PasswordAuth {
    fn name(&self) -> &'static str {
        "password"
    }

    fn build_request(&self, ctx: &AuthContext) -> UserAuthResult<SshBuffer> {
        let mut buf = request_header(ctx, self.name());
        buf.put_bool(false);
        buf.put_string(&self.password);
        Ok(buf)
    }

    fn handle_reply(
        &self,
        _msg: MessageType,
        buf: &mut SshBuffer,
        ctx: &AuthContext,
    ) -> UserAuthResult<Option<SshBuffer>> {
        // SSH_MSG_USERAUTH_PASSWD_CHANGEREQ
        let prompt = buf.get_string().map_err(UserAuthError::from)?;
        let _language = buf.get_string().map_err(UserAuthError::from)?;
        info!(%prompt, "server requests password change");

        let Some(callback) = self.change_callback.as_ref() else {
            return Err(UserAuthError::MethodFailed {
                method: self.name().to_string(),
            });
        };
        let Some(new_password) = callback(&prompt) else {
            return Err(UserAuthError::MethodFailed {
                method: self.name().to_string(),
            });
        };

        let mut reply = request_header(ctx, self.name());
        reply.put_bool(true);
        reply.put_string(&self.password);
        reply.put_string(&new_password);
        Ok(Some(reply))
    }
}

/// The `publickey` method (RFC 4252 Section 7), two-phase.
pub struct PublicKeyAuth {
    signer: Arc<dyn Signer>,
}

impl PublicKeyAuth {
    /// Creates a publickey method over the given signer.
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }

    /// The exact bytes the client signs (RFC 4252 Section 7).
    fn signature_data(&self, ctx: &AuthContext) -> Vec<u8> {
        let mut data = SshBuffer::new();
        data.put_bytes(&ctx.session_id);
        data.put_u8(MessageType::UserauthRequest as u8);
        data.put_string(&ctx.username);
        data.put_string(&ctx.service_name);
        data.put_string(self.name());
        data.put_bool(true);
        data.put_string(self.signer.algorithm());
        data.put_bytes(&self.signer.public_key_blob());
        data.compact()
    }
}

impl AuthMethod for PublicKeyAuth {
    fn name(&self) -> &'static str {
        "publickey"
    }

    fn build_request(&self, ctx: &AuthContext) -> UserAuthResult<SshBuffer> {
        // Probe without a signature first.
        let mut buf = request_header(ctx, self.name());
        buf.put_bool(false);
        buf.put_string(self.signer.algorithm());
        buf.put_bytes(&self.signer.public_key_blob());
        Ok(buf)
    }

    fn handle_reply(
        &self,
        _msg: MessageType,
        buf: &mut SshBuffer,
        ctx: &AuthContext,
    ) -> UserAuthResult<Option<SshBuffer>> {
        // SSH_MSG_USERAUTH_PK_OK echoes the key we probed with.
        let algorithm = buf.get_string().map_err(UserAuthError::from)?;
        let _blob = buf.get_bytes().map_err(UserAuthError::from)?;
        if algorithm != self.signer.algorithm() {
            return Err(UserAuthError::MethodFailed {
                method: self.name().to_string(),
            });
        }
        debug!("server accepted key, sending signature");

        let raw_signature = self
            .signer
            .sign(&self.signature_data(ctx))
            .map_err(UserAuthError::from)?;
        let mut signature_blob = SshBuffer::new();
        signature_blob.put_string(self.signer.algorithm());
        signature_blob.put_bytes(&raw_signature);

        let mut reply = request_header(ctx, self.name());
        reply.put_bool(true);
        reply.put_string(self.signer.algorithm());
        reply.put_bytes(&self.signer.public_key_blob());
        reply.put_bytes(&signature_blob.compact());
        Ok(Some(reply))
    }
}

/// One prompt of an INFO_REQUEST round.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// The prompt text.
    pub text: String,
    /// Whether the response may be echoed.
    pub echo: bool,
}

/// Callback answering one keyboard-interactive round: name, instruction,
/// prompts in, responses out (one per prompt, in order).
pub type InteractiveCallback = Box<dyn Fn(&str, &str, &[Prompt]) -> Vec<String> + Send + Sync>;

/// The `keyboard-interactive` method (RFC 4256).
pub struct InteractiveAuth {
    submethods: String,
    callback: InteractiveCallback,
}

impl InteractiveAuth {
    /// Creates a keyboard-interactive method with the given prompt callback.
    pub fn new(callback: InteractiveCallback) -> Self {
        Self {
            submethods: String::new(),
            callback,
        }
    }
}

impl AuthMethod for InteractiveAuth {
    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }

    fn build_request(&self, ctx: &AuthContext) -> UserAuthResult<SshBuffer> {
        let mut buf = request_header(ctx, self.name());
        buf.put_string(""); // language tag
        buf.put_string(&self.submethods);
        Ok(buf)
    }

    fn handle_reply(
        &self,
        _msg: MessageType,
        buf: &mut SshBuffer,
        _ctx: &AuthContext,
    ) -> UserAuthResult<Option<SshBuffer>> {
        // SSH_MSG_USERAUTH_INFO_REQUEST
        let name = buf.get_string().map_err(UserAuthError::from)?;
        let instruction = buf.get_string().map_err(UserAuthError::from)?;
        let _language = buf.get_string().map_err(UserAuthError::from)?;
        let count = buf.get_u32().map_err(UserAuthError::from)? as usize;

        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            let text = buf.get_string().map_err(UserAuthError::from)?;
            let echo = buf.get_bool().map_err(UserAuthError::from)?;
            prompts.push(Prompt { text, echo });
        }

        let responses = (self.callback)(&name, &instruction, &prompts);
        if responses.len() != prompts.len() {
            return Err(UserAuthError::MethodFailed {
                method: self.name().to_string(),
            });
        }

        let mut reply = SshBuffer::for_message(MessageType::UserauthInfoResponse);
        reply.put_u32(responses.len() as u32);
        for response in &responses {
            reply.put_string(response);
        }
        Ok(Some(reply))
    }
}

#[derive(Debug, Clone)]
enum AuthVerdict {
    Success,
    Failure { methods: Vec<String>, partial: bool },
}

struct Attempt {
    method: Arc<dyn AuthMethod>,
    verdict: Event<AuthVerdict, UserAuthError>,
}

struct UserAuthInner {
    transport: Transport,
    attempt: Mutex<Option<Attempt>>,
    context: Mutex<Option<AuthContext>>,
    banner: Mutex<Option<String>>,
}

/// The `ssh-userauth` service.
#[derive(Clone)]
pub struct UserAuth {
    inner: Arc<UserAuthInner>,
}

impl UserAuth {
    /// Creates the service over a connected transport.
    pub fn new(transport: Transport) -> Self {
        Self {
            inner: Arc::new(UserAuthInner {
                transport,
                attempt: Mutex::new(None),
                context: Mutex::new(None),
                banner: Mutex::new(None),
            }),
        }
    }

    /// The banner the server sent during authentication, if any.
    pub fn banner(&self) -> Option<String> {
        self.inner.banner.lock().expect("userauth lock poisoned").clone()
    }

    /// Runs the method loop for `username`, activating `next_service` on
    /// success.
    ///
    /// A probe with the `none` method learns the allowed methods first.
    /// Methods not currently advertised by the server are skipped. Partial
    /// success keeps the loop going with the remaining methods.
    pub async fn authenticate(
        &self,
        username: &str,
        next_service: Arc<dyn Service>,
        methods: Vec<Arc<dyn AuthMethod>>,
    ) -> UserAuthResult<()> {
        let session_id = self.inner.transport.session_id().ok_or_else(|| {
            UserAuthError::Transport(TransportError::KexFailed(
                "no session identifier yet".to_string(),
            ))
        })?;
        let ctx = AuthContext {
            username: username.to_string(),
            service_name: next_service.name().to_string(),
            session_id,
        };
        *self.inner.context.lock().expect("userauth lock poisoned") = Some(ctx.clone());

        self.inner
            .transport
            .request_service(Arc::new(self.clone()))
            .await
            .map_err(UserAuthError::from)?;

        // Learn the allowed methods.
        let mut allowed = match self.attempt(Arc::new(NoneAuth), &ctx).await? {
            AuthVerdict::Success => {
                self.finish(&next_service);
                return Ok(());
            }
            AuthVerdict::Failure { methods, .. } => methods,
        };
        debug!(?allowed, "allowed authentication methods");

        for method in methods {
            if !allowed.iter().any(|name| name == method.name()) {
                debug!(method = method.name(), "method not advertised, skipping");
                continue;
            }
            info!(method = method.name(), "attempting authentication");
            match self.attempt(Arc::clone(&method), &ctx).await {
                Ok(AuthVerdict::Success) => {
                    self.finish(&next_service);
                    return Ok(());
                }
                Ok(AuthVerdict::Failure { methods, partial }) => {
                    if partial {
                        info!(method = method.name(), "partial success, more required");
                    }
                    allowed = methods;
                }
                Err(UserAuthError::MethodFailed { method }) => {
                    debug!(%method, "method failed, trying next");
                }
                Err(err) => return Err(err),
            }
        }
        Err(UserAuthError::Exhausted)
    }

    fn finish(&self, next_service: &Arc<dyn Service>) {
        info!("authentication succeeded");
        self.inner.transport.set_authenticated();
        self.inner
            .transport
            .set_active_service(Arc::clone(next_service));
    }

    async fn attempt(
        &self,
        method: Arc<dyn AuthMethod>,
        ctx: &AuthContext,
    ) -> UserAuthResult<AuthVerdict> {
        let verdict = Event::new("auth attempt");
        *self.inner.attempt.lock().expect("userauth lock poisoned") = Some(Attempt {
            method: Arc::clone(&method),
            verdict: verdict.clone(),
        });

        let packet = method.build_request(ctx)?;
        self.inner
            .transport
            .write(packet)
            .await
            .map_err(UserAuthError::from)?;
        verdict.wait(self.inner.transport.timeout()).await
    }

    fn resolve(&self, result: Result<AuthVerdict, UserAuthError>) {
        let attempt = self.inner.attempt.lock().expect("userauth lock poisoned");
        if let Some(attempt) = attempt.as_ref() {
            match result {
                Ok(verdict) => attempt.verdict.set(verdict),
                Err(err) => attempt.verdict.error(err),
            }
        } else {
            warn!("authentication reply with no attempt outstanding");
        }
    }
}

#[async_trait]
impl Service for UserAuth {
    fn name(&self) -> &'static str {
        "ssh-userauth"
    }

    fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    async fn handle(&self, seq: u32, msg: MessageType, mut buf: SshBuffer) -> TransportResult<()> {
        match msg {
            MessageType::UserauthBanner => {
                let text = buf.get_string()?;
                let _language = buf.get_string()?;
                info!("authentication banner received");
                *self.inner.banner.lock().expect("userauth lock poisoned") = Some(text);
                Ok(())
            }
            MessageType::UserauthSuccess => {
                self.resolve(Ok(AuthVerdict::Success));
                Ok(())
            }
            MessageType::UserauthFailure => {
                let methods = buf.get_name_list()?;
                let partial = buf.get_bool()?;
                debug!(?methods, partial, "authentication failure");
                self.resolve(Ok(AuthVerdict::Failure { methods, partial }));
                Ok(())
            }
            MessageType::Userauth60 => {
                let (method, ctx) = {
                    let attempt = self.inner.attempt.lock().expect("userauth lock poisoned");
                    let context = self.inner.context.lock().expect("userauth lock poisoned");
                    match (attempt.as_ref(), context.as_ref()) {
                        (Some(attempt), Some(ctx)) => {
                            (Arc::clone(&attempt.method), ctx.clone())
                        }
                        _ => {
                            return Err(TransportError::protocol(
                                "method-specific reply with no attempt outstanding",
                            ))
                        }
                    }
                };
                match method.handle_reply(msg, &mut buf, &ctx) {
                    Ok(Some(packet)) => {
                        self.inner.transport.write(packet).await?;
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(err) => {
                        // Method-level failure; the loop moves on.
                        self.resolve(Err(err));
                        Ok(())
                    }
                }
            }
            _ => {
                warn!(%msg, "unexpected message for ssh-userauth");
                self.inner.transport.send_unimplemented(seq).await
            }
        }
    }

    fn notify_error(&self, err: &TransportError) {
        if let Some(attempt) = self
            .inner
            .attempt
            .lock()
            .expect("userauth lock poisoned")
            .as_ref()
        {
            attempt.verdict.notify_error(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::SystemRandom;
    use crate::ssh::hostkey::Ed25519Signer;

    fn ctx() -> AuthContext {
        AuthContext {
            username: "alice".to_string(),
            service_name: "ssh-connection".to_string(),
            session_id: vec![0xaa; 20],
        }
    }

    fn read_header(buf: &mut SshBuffer) -> (String, String, String) {
        assert_eq!(buf.get_u8().unwrap(), MessageType::UserauthRequest as u8);
        (
            buf.get_string().unwrap(),
            buf.get_string().unwrap(),
            buf.get_string().unwrap(),
        )
    }

    #[test]
    fn test_none_request_wire_form() {
        let mut buf = NoneAuth.build_request(&ctx()).unwrap();
        let (user, service, method) = read_header(&mut buf);
        assert_eq!(user, "alice");
        assert_eq!(service, "ssh-connection");
        assert_eq!(method, "none");
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn test_password_request_wire_form() {
        let auth = PasswordAuth::new("hunter2");
        let mut buf = auth.build_request(&ctx()).unwrap();
        let (_, _, method) = read_header(&mut buf);
        assert_eq!(method, "password");
        assert!(!buf.get_bool().unwrap());
        assert_eq!(buf.get_string().unwrap(), "hunter2");
    }

    #[test]
    fn test_password_change_request_with_callback() {
        let auth = PasswordAuth::new("old")
            .with_change_callback(Box::new(|_prompt| Some("new".to_string())));

        let mut change_req = SshBuffer::new();
        change_req.put_string("password expired");
        change_req.put_string("");

        let reply = auth
            .handle_reply(MessageType::Userauth60, &mut change_req, &ctx())
            .unwrap()
            .unwrap();
        let mut reply = SshBuffer::from_payload(reply.payload().to_vec());
        let (_, _, method) = read_header(&mut reply);
        assert_eq!(method, "password");
        assert!(reply.get_bool().unwrap());
        assert_eq!(reply.get_string().unwrap(), "old");
        assert_eq!(reply.get_string().unwrap(), "new");
    }

    #[test]
    fn test_password_change_request_without_callback_fails() {
        let auth = PasswordAuth::new("old");
        let mut change_req = SshBuffer::new();
        change_req.put_string("password expired");
        change_req.put_string("");

        assert!(matches!(
            auth.handle_reply(MessageType::Userauth60, &mut change_req, &ctx()),
            Err(UserAuthError::MethodFailed { .. })
        ));
    }

    #[test]
    fn test_publickey_probe_has_no_signature() {
        let signer = Arc::new(Ed25519Signer::generate(&SystemRandom));
        let auth = PublicKeyAuth::new(signer.clone());
        let mut buf = auth.build_request(&ctx()).unwrap();
        let (_, _, method) = read_header(&mut buf);
        assert_eq!(method, "publickey");
        assert!(!buf.get_bool().unwrap());
        assert_eq!(buf.get_string().unwrap(), "ssh-ed25519");
        assert_eq!(buf.get_bytes().unwrap(), signer.public_key_blob());
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn test_publickey_pk_ok_produces_valid_signature() {
        use crate::ssh::hostkey::verify_ssh_ed25519;

        let signer = Arc::new(Ed25519Signer::generate(&SystemRandom));
        let auth = PublicKeyAuth::new(signer.clone());
        let context = ctx();

        let mut pk_ok = SshBuffer::new();
        pk_ok.put_string("ssh-ed25519");
        pk_ok.put_bytes(&signer.public_key_blob());

        let reply = auth
            .handle_reply(MessageType::Userauth60, &mut pk_ok, &context)
            .unwrap()
            .unwrap();
        let mut reply = SshBuffer::from_payload(reply.payload().to_vec());
        let (_, _, _) = read_header(&mut reply);
        assert!(reply.get_bool().unwrap());
        let _alg = reply.get_string().unwrap();
        let blob = reply.get_bytes().unwrap();
        let signature_blob = reply.get_bytes().unwrap();

        // The server-side check: signature over session_id || request.
        let data = auth.signature_data(&context);
        assert!(verify_ssh_ed25519(&blob, &data, &signature_blob).unwrap());
    }

    #[test]
    fn test_interactive_round() {
        let auth = InteractiveAuth::new(Box::new(|name, _instruction, prompts| {
            assert_eq!(name, "OTP");
            prompts.iter().map(|p| format!("answer-{}", p.text)).collect()
        }));

        let mut info_req = SshBuffer::new();
        info_req.put_string("OTP");
        info_req.put_string("enter codes");
        info_req.put_string("");
        info_req.put_u32(2);
        info_req.put_string("a");
        info_req.put_bool(true);
        info_req.put_string("b");
        info_req.put_bool(false);

        let reply = auth
            .handle_reply(MessageType::Userauth60, &mut info_req, &ctx())
            .unwrap()
            .unwrap();
        let mut reply = SshBuffer::from_payload(reply.payload().to_vec());
        assert_eq!(
            reply.get_u8().unwrap(),
            MessageType::UserauthInfoResponse as u8
        );
        assert_eq!(reply.get_u32().unwrap(), 2);
        assert_eq!(reply.get_string().unwrap(), "answer-a");
        assert_eq!(reply.get_string().unwrap(), "answer-b");
    }

    #[test]
    fn test_interactive_wrong_response_count_fails() {
        let auth = InteractiveAuth::new(Box::new(|_, _, _| Vec::new()));

        let mut info_req = SshBuffer::new();
        info_req.put_string("");
        info_req.put_string("");
        info_req.put_string("");
        info_req.put_u32(1);
        info_req.put_string("prompt");
        info_req.put_bool(true);

        assert!(matches!(
            auth.handle_reply(MessageType::Userauth60, &mut info_req, &ctx()),
            Err(UserAuthError::MethodFailed { .. })
        ));
    }
}
