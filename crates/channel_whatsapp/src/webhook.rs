use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use channel_transport::TransportError;

type HmacSha256 = Hmac<Sha256>;

/// Answer the subscription handshake Meta performs when a webhook is registered.
/// Returns the challenge that must be echoed back.
pub fn verify_subscription(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    verify_token: &str,
) -> Result<String, TransportError> {
    match (mode, token, challenge) {
        (Some("subscribe"), Some(token), Some(challenge)) if token == verify_token => {
            Ok(challenge.to_string())
        }
        (Some("subscribe"), Some(_), Some(_)) => {
            Err(TransportError::NotAuthorized("verify token mismatch".into()))
        }
        _ => Err(TransportError::Permanent("malformed verification request".into())),
    }
}

/// Check the `X-Hub-Signature-256` header against the raw request body.
pub fn verify_signature(app_secret: &str, body: &[u8], header: &str) -> Result<(), TransportError> {
    let digest = header
        .strip_prefix("sha256=")
        .ok_or_else(|| TransportError::NotAuthorized("signature header lacks sha256= prefix".into()))?;
    let expected = hex::decode(digest)
        .map_err(|_| TransportError::NotAuthorized("signature is not valid hex".into()))?;
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .map_err(|e| TransportError::Permanent(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| TransportError::NotAuthorized("signature mismatch".into()))
}

pub(crate) fn sign(app_secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes()).ok()?;
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    Some(format!("sha256={}", hex::encode(digest)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebhookPayload {
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Entry {
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Change {
    pub value: ChangeValue,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub messages: Vec<WaMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Metadata {
    pub phone_number_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Contact {
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<Profile>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Profile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WaMessage {
    pub from: String,
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub image: Option<WaMedia>,
    #[serde(default)]
    pub document: Option<WaMedia>,
    #[serde(default)]
    pub audio: Option<WaMedia>,
    #[serde(default)]
    pub video: Option<WaMedia>,
    #[serde(default)]
    pub interactive: Option<Interactive>,
    #[serde(default)]
    pub button: Option<Button>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TextBody {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WaMedia {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Interactive {
    #[serde(default)]
    pub button_reply: Option<Reply>,
    #[serde(default)]
    pub list_reply: Option<Reply>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Reply {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Button {
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}
