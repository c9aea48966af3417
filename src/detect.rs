//! Server variant detection.
//!
//! The remote-debugging wire protocol is served by two protocol-compatible
//! implementations that differ subtly in API surface and resource limits:
//!
//! - **Node inspector**: the bare V8 inspector embedded in Node-style
//!   runtimes. Lean HTTP surface, debugger URL at a bare-UUID path.
//! - **Chromium**: the full browser endpoint. Richer capability
//!   endpoints, `V8-Version`/`WebKit-Version` metadata, debugger URL
//!   under `/devtools/`.
//!
//! Classification applies an explicit prioritized rule list with
//! short-circuit precedence, so the policy is auditable and each rule is
//! independently testable:
//!
//! 1. `runtime-browser-field`: variant-specific `Browser` prefix.
//! 2. `webkit-signature`: `WebKit-Version` only ever appears on Chromium.
//! 3. `missing-v8-signature`: Chromium always reports `V8-Version`;
//!    its absence means Node inspector.
//! 4. `inspector-path-override`: a debugger URL at the inspector's
//!    canonical bare-UUID path wins over any weaker Chromium signal.
//! 5. `capability-probe`: actively probe Chromium-only endpoints with a
//!    tight timeout; any 200 confirms Chromium, otherwise default to the
//!    leaner inspector surface.

// ============================================================================
// Imports
// ============================================================================

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::TargetId;

// ============================================================================
// Constants
// ============================================================================

/// Timeout for the discovery endpoint (`/json/version`).
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for each capability probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(750);

/// Capability-only endpoints served by Chromium but not by the inspector.
const CHROMIUM_PROBE_PATHS: &[&str] = &["/json/new?about:blank", "/json/protocol"];

/// Canonical inspector debugger path: a bare UUID at the root.
fn inspector_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^/[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .expect("static pattern compiles")
    })
}

// ============================================================================
// ServerVariant
// ============================================================================

/// The two protocol-compatible server implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerVariant {
    /// Bare V8 inspector embedded in a Node-style runtime.
    NodeInspector,
    /// Full Chromium browser endpoint.
    Chromium,
}

impl ServerVariant {
    /// Returns `true` for the full browser endpoint.
    #[inline]
    #[must_use]
    pub const fn is_browser(self) -> bool {
        matches!(self, Self::Chromium)
    }
}

// ============================================================================
// VersionMetadata
// ============================================================================

/// Payload of `GET /json/version`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionMetadata {
    /// Reported implementation string, e.g. `Chrome/131.0.6778.86` or
    /// `node.js/v22.11.0`.
    #[serde(rename = "Browser", default)]
    pub browser: Option<String>,

    /// Advertised protocol version.
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: Option<String>,

    /// V8 engine version. Chromium always includes this.
    #[serde(rename = "V8-Version", default)]
    pub v8_version: Option<String>,

    /// WebKit version. Only ever present on Chromium.
    #[serde(rename = "WebKit-Version", default)]
    pub webkit_version: Option<String>,

    /// User agent string.
    #[serde(rename = "User-Agent", default)]
    pub user_agent: Option<String>,

    /// Advertised debugger WebSocket URL.
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub debugger_url: Option<String>,
}

// ============================================================================
// CapabilityFlags
// ============================================================================

/// Metadata fields observed on the discovery payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    /// `V8-Version` was present.
    pub has_v8_version: bool,
    /// `WebKit-Version` was present.
    pub has_webkit_version: bool,
    /// `User-Agent` was present.
    pub has_user_agent: bool,
}

impl CapabilityFlags {
    fn from_metadata(meta: &VersionMetadata) -> Self {
        Self {
            has_v8_version: meta.v8_version.is_some(),
            has_webkit_version: meta.webkit_version.is_some(),
            has_user_agent: meta.user_agent.is_some(),
        }
    }
}

// ============================================================================
// ServerVariantInfo
// ============================================================================

/// Result of variant detection.
#[derive(Debug, Clone)]
pub struct ServerVariantInfo {
    /// Derived classification.
    pub variant: ServerVariant,

    /// Reported implementation string.
    pub version: String,

    /// Advertised protocol version, if any.
    pub protocol_version: Option<String>,

    /// Metadata fields observed on the payload.
    pub capabilities: CapabilityFlags,

    /// Capability endpoints that answered 200 during probing.
    pub confirmed_probes: Vec<String>,

    /// Advertised debugger WebSocket URL, if any.
    pub debugger_url: Option<String>,

    /// Name of the rule that decided the classification.
    pub decided_by: &'static str,
}

// ============================================================================
// TargetInfo
// ============================================================================

/// One entry of the `GET /json` target list.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInfo {
    /// Opaque target identifier.
    pub id: TargetId,

    /// Target kind, e.g. `page` or `worker`.
    #[serde(rename = "type", default)]
    pub target_type: String,

    /// Human-readable title.
    #[serde(default)]
    pub title: String,

    /// Current URL of the target.
    #[serde(default)]
    pub url: String,

    /// Target-scoped debugger WebSocket URL.
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub debugger_url: Option<String>,
}

// ============================================================================
// Classification Rules
// ============================================================================

/// One ordered classification predicate.
struct Rule {
    /// Stable rule name, reported in [`ServerVariantInfo::decided_by`].
    name: &'static str,
    /// Returns a classification, or `None` to fall through.
    apply: fn(&VersionMetadata) -> Option<ServerVariant>,
}

/// Metadata-only rules, in strict precedence order.
///
/// The active capability probe is not listed here; it only runs when
/// every metadata rule falls through.
static METADATA_RULES: &[Rule] = &[
    Rule {
        name: "runtime-browser-field",
        apply: rule_runtime_browser_field,
    },
    Rule {
        name: "webkit-signature",
        apply: rule_webkit_signature,
    },
    Rule {
        name: "missing-v8-signature",
        apply: rule_missing_v8_signature,
    },
    Rule {
        name: "inspector-path-override",
        apply: rule_inspector_path_override,
    },
];

fn rule_runtime_browser_field(meta: &VersionMetadata) -> Option<ServerVariant> {
    let browser = meta.browser.as_deref()?;
    if browser.starts_with("node.js/") || browser.starts_with("deno/") {
        return Some(ServerVariant::NodeInspector);
    }
    if browser.contains("Chrome/") || browser.contains("Chromium/") || browser.contains("Edg/") {
        return Some(ServerVariant::Chromium);
    }
    None
}

fn rule_webkit_signature(meta: &VersionMetadata) -> Option<ServerVariant> {
    meta.webkit_version.as_ref().map(|_| ServerVariant::Chromium)
}

fn rule_missing_v8_signature(meta: &VersionMetadata) -> Option<ServerVariant> {
    if meta.v8_version.is_none() {
        Some(ServerVariant::NodeInspector)
    } else {
        None
    }
}

fn rule_inspector_path_override(meta: &VersionMetadata) -> Option<ServerVariant> {
    let raw = meta.debugger_url.as_deref()?;
    let url = Url::parse(raw).ok()?;
    if inspector_path_pattern().is_match(url.path()) {
        Some(ServerVariant::NodeInspector)
    } else {
        None
    }
}

/// Applies the metadata rules in order, short-circuiting on the first
/// decision. Returns the classification and the deciding rule's name.
fn classify_metadata(meta: &VersionMetadata) -> Option<(ServerVariant, &'static str)> {
    for rule in METADATA_RULES {
        if let Some(variant) = (rule.apply)(meta) {
            trace!(rule = rule.name, ?variant, "metadata rule matched");
            return Some((variant, rule.name));
        }
    }
    None
}

// ============================================================================
// Detector
// ============================================================================

/// Probes a discovery endpoint and classifies the server variant.
#[derive(Debug, Clone)]
pub struct Detector {
    http: reqwest::Client,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    /// Creates a detector with a fresh HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Detects the server variant behind `host:port`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unreachable`] if `/json/version` does not answer within
    ///   the discovery timeout or answers with a non-success status
    /// - [`Error::Protocol`] if the payload is not valid version metadata
    pub async fn detect(&self, host: &str, port: u16) -> Result<ServerVariantInfo> {
        let base = format!("http://{host}:{port}");
        let meta = self.fetch_version(&base).await?;
        let capabilities = CapabilityFlags::from_metadata(&meta);

        let (variant, decided_by, confirmed_probes) = match classify_metadata(&meta) {
            Some((variant, rule)) => (variant, rule, Vec::new()),
            None => {
                let confirmed = self.probe_capabilities(&base).await;
                let variant = if confirmed.is_empty() {
                    ServerVariant::NodeInspector
                } else {
                    ServerVariant::Chromium
                };
                (variant, "capability-probe", confirmed)
            }
        };

        debug!(
            ?variant,
            rule = decided_by,
            version = meta.browser.as_deref().unwrap_or(""),
            "server variant detected"
        );

        Ok(ServerVariantInfo {
            variant,
            version: meta.browser.unwrap_or_default(),
            protocol_version: meta.protocol_version,
            capabilities,
            confirmed_probes,
            debugger_url: meta.debugger_url,
            decided_by,
        })
    }

    /// Fetches the list of active debug targets from `GET /json`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unreachable`] if the endpoint does not answer
    /// - [`Error::Protocol`] if the payload is not a target list
    pub async fn fetch_targets(&self, host: &str, port: u16) -> Result<Vec<TargetInfo>> {
        let endpoint = format!("http://{host}:{port}/json");

        let response = self
            .http
            .get(&endpoint)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|_| Error::unreachable(&endpoint))?;

        if !response.status().is_success() {
            return Err(Error::unreachable(&endpoint));
        }

        response
            .json::<Vec<TargetInfo>>()
            .await
            .map_err(|e| Error::protocol(format!("malformed target list: {e}")))
    }

    /// Fetches and parses `/json/version`.
    async fn fetch_version(&self, base: &str) -> Result<VersionMetadata> {
        let endpoint = format!("{base}/json/version");

        let response = self
            .http
            .get(&endpoint)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|_| Error::unreachable(&endpoint))?;

        if !response.status().is_success() {
            return Err(Error::unreachable(&endpoint));
        }

        response
            .json::<VersionMetadata>()
            .await
            .map_err(|e| Error::protocol(format!("malformed version metadata: {e}")))
    }

    /// Probes Chromium-only capability endpoints.
    ///
    /// Returns the paths that answered 200. Unreachable or non-200
    /// probes are not errors; they simply fail to confirm.
    async fn probe_capabilities(&self, base: &str) -> Vec<String> {
        let mut confirmed = Vec::new();

        for path in CHROMIUM_PROBE_PATHS {
            let endpoint = format!("{base}{path}");
            match self
                .http
                .get(&endpoint)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(response) if response.status().as_u16() == 200 => {
                    debug!(path, "capability probe confirmed");
                    confirmed.push((*path).to_string());
                }
                Ok(response) => {
                    trace!(path, status = %response.status(), "capability probe declined");
                }
                Err(e) => {
                    warn!(path, error = %e, "capability probe failed");
                }
            }
        }

        confirmed
    }
}

/// Detects the server variant behind `host:port` with a fresh detector.
///
/// Convenience wrapper around [`Detector::detect`].
///
/// # Errors
///
/// See [`Detector::detect`].
pub async fn detect(host: &str, port: u16) -> Result<ServerVariantInfo> {
    Detector::new().detect(host, port).await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(json: &str) -> VersionMetadata {
        serde_json::from_str(json).expect("parse metadata")
    }

    #[test]
    fn test_metadata_deserialization() {
        let meta = metadata(
            r#"{
                "Browser": "Chrome/131.0.6778.86",
                "Protocol-Version": "1.3",
                "V8-Version": "13.1.201.8",
                "WebKit-Version": "537.36",
                "User-Agent": "Mozilla/5.0",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc"
            }"#,
        );

        assert_eq!(meta.browser.as_deref(), Some("Chrome/131.0.6778.86"));
        assert_eq!(meta.v8_version.as_deref(), Some("13.1.201.8"));
        assert!(meta.debugger_url.is_some());
    }

    #[test]
    fn test_browser_field_classifies_inspector() {
        let meta = metadata(r#"{"Browser": "node.js/v22.11.0"}"#);
        let (variant, rule) = classify_metadata(&meta).expect("classified");
        assert_eq!(variant, ServerVariant::NodeInspector);
        assert_eq!(rule, "runtime-browser-field");
    }

    #[test]
    fn test_browser_field_classifies_chromium() {
        let meta = metadata(r#"{"Browser": "HeadlessChrome/131.0.6778.86"}"#);
        let (variant, rule) = classify_metadata(&meta).expect("classified");
        assert_eq!(variant, ServerVariant::Chromium);
        assert_eq!(rule, "runtime-browser-field");
    }

    #[test]
    fn test_webkit_signature_wins_over_ambiguous_url() {
        // Chromium signature field present, debugger URL path ambiguous:
        // signature precedence classifies Chromium.
        let meta = metadata(
            r#"{
                "Browser": "CustomShell/1.0",
                "V8-Version": "13.1.201.8",
                "WebKit-Version": "537.36",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/session"
            }"#,
        );

        let (variant, rule) = classify_metadata(&meta).expect("classified");
        assert_eq!(variant, ServerVariant::Chromium);
        assert_eq!(rule, "webkit-signature");
    }

    #[test]
    fn test_missing_v8_signature_classifies_inspector() {
        let meta = metadata(r#"{"Browser": "CustomShell/1.0"}"#);
        let (variant, rule) = classify_metadata(&meta).expect("classified");
        assert_eq!(variant, ServerVariant::NodeInspector);
        assert_eq!(rule, "missing-v8-signature");
    }

    #[test]
    fn test_inspector_path_override_beats_weak_chromium_signal() {
        // V8-Version present (weak Chromium signal), no signature field,
        // canonical inspector path: the strong positive wins.
        let meta = metadata(
            r#"{
                "Browser": "CustomShell/1.0",
                "V8-Version": "13.1.201.8",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9229/7f38c291-0c25-4b42-ba2c-4d6b7d0f1a9e"
            }"#,
        );

        let (variant, rule) = classify_metadata(&meta).expect("classified");
        assert_eq!(variant, ServerVariant::NodeInspector);
        assert_eq!(rule, "inspector-path-override");
    }

    #[test]
    fn test_devtools_path_does_not_match_inspector_pattern() {
        let meta = metadata(
            r#"{
                "Browser": "CustomShell/1.0",
                "V8-Version": "13.1.201.8",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/7f38c291-0c25-4b42-ba2c-4d6b7d0f1a9e"
            }"#,
        );

        // No metadata rule decides; classification falls to the probe.
        assert!(classify_metadata(&meta).is_none());
    }

    #[test]
    fn test_rules_are_ordered() {
        let names: Vec<_> = METADATA_RULES.iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            vec![
                "runtime-browser-field",
                "webkit-signature",
                "missing-v8-signature",
                "inspector-path-override",
            ]
        );
    }

    #[test]
    fn test_capability_flags() {
        let meta = metadata(r#"{"V8-Version": "13.1", "User-Agent": "UA"}"#);
        let flags = CapabilityFlags::from_metadata(&meta);
        assert!(flags.has_v8_version);
        assert!(!flags.has_webkit_version);
        assert!(flags.has_user_agent);
    }

    #[test]
    fn test_target_info_deserialization() {
        let targets: Vec<TargetInfo> = serde_json::from_str(
            r#"[{
                "id": "T1",
                "type": "page",
                "title": "Example",
                "url": "https://example.com",
                "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/T1"
            }]"#,
        )
        .expect("parse targets");

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id.as_str(), "T1");
        assert_eq!(targets[0].target_type, "page");
    }

    #[tokio::test]
    async fn test_detect_unreachable() {
        // Port 1 on localhost is essentially guaranteed closed.
        let err = detect("127.0.0.1", 1).await.expect_err("unreachable");
        assert!(matches!(err, Error::Unreachable { .. }));
    }
}
