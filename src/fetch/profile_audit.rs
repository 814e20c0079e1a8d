//! Browser profile health audit.
//!
//! Before a task's first navigation the profile's observable fingerprint
//! (UA, language, timezone, font signature, canvas/audio digests, screen)
//! is captured and diffed against a stored baseline. Drift routes to repair
//! actions. The audit is strictly non-blocking: any failure here logs and
//! lets the host navigation proceed.

use std::path::PathBuf;

use chromiumoxide::page::Page;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Observable profile fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFingerprint {
    pub user_agent: String,
    pub ua_major_version: Option<u32>,
    pub language: String,
    pub timezone: String,
    pub font_signature: String,
    pub canvas_hash: String,
    pub audio_hash: String,
    pub screen: (u32, u32),
}

impl ProfileFingerprint {
    /// Attribute names that differ between two fingerprints.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<&'static str> {
        let mut drifted = Vec::new();
        if self.ua_major_version != other.ua_major_version {
            drifted.push("ua_major_version");
        }
        if self.language != other.language {
            drifted.push("language");
        }
        if self.timezone != other.timezone {
            drifted.push("timezone");
        }
        if self.font_signature != other.font_signature {
            drifted.push("font_signature");
        }
        if self.canvas_hash != other.canvas_hash {
            drifted.push("canvas_hash");
        }
        if self.audio_hash != other.audio_hash {
            drifted.push("audio_hash");
        }
        if self.screen != other.screen {
            drifted.push("screen");
        }
        drifted
    }
}

/// Audit outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Healthy,
    Drift,
    Fail,
}

/// Repair actions dispatched per drifted attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Inject a restart flag so the next browser start re-applies the
    /// pinned UA/version.
    RestartFlag,
    /// Re-sync the font set against the baseline manifest.
    FontResync,
    /// Recreate the research profile from the pristine template.
    ProfileRecreate,
}

impl RepairAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RestartFlag => "restart_flag",
            Self::FontResync => "font_resync",
            Self::ProfileRecreate => "profile_recreate",
        }
    }

    /// Which repair covers a drifted attribute.
    #[must_use]
    pub fn for_attribute(attribute: &str) -> Self {
        match attribute {
            "font_signature" => Self::FontResync,
            "canvas_hash" | "audio_hash" | "screen" => Self::ProfileRecreate,
            _ => Self::RestartFlag,
        }
    }
}

/// Full audit result.
#[derive(Debug, Clone)]
pub struct AuditResult {
    pub status: AuditStatus,
    pub drifted: Vec<&'static str>,
    pub repairs: Vec<RepairAction>,
    pub error: Option<String>,
}

const FINGERPRINT_SCRIPT: &str = r#"(() => {
    const canvas = document.createElement('canvas');
    canvas.width = 200; canvas.height = 40;
    const ctx = canvas.getContext('2d');
    let canvasData = '';
    if (ctx) {
        ctx.textBaseline = 'top';
        ctx.font = '14px Arial';
        ctx.fillStyle = '#f60';
        ctx.fillRect(10, 2, 60, 20);
        ctx.fillStyle = '#069';
        ctx.fillText('lancet-audit', 2, 18);
        canvasData = canvas.toDataURL();
    }
    const fonts = ['Arial', 'Courier New', 'Georgia', 'Times New Roman',
                   'Verdana', 'Meiryo', 'Hiragino Sans'];
    const present = fonts.filter(f => document.fonts && document.fonts.check('12px "' + f + '"'));
    return {
        user_agent: navigator.userAgent,
        language: navigator.language || '',
        timezone: Intl.DateTimeFormat().resolvedOptions().timeZone || '',
        fonts: present.join(','),
        canvas_data: canvasData,
        screen_w: screen.width,
        screen_h: screen.height,
    };
})()"#;

#[derive(Debug, Deserialize)]
struct RawFingerprint {
    user_agent: String,
    language: String,
    timezone: String,
    fonts: String,
    canvas_data: String,
    screen_w: u32,
    screen_h: u32,
}

/// Profile auditor with a JSON baseline on disk.
#[derive(Debug, Clone)]
pub struct ProfileAuditor {
    baseline_path: PathBuf,
}

impl ProfileAuditor {
    #[must_use]
    pub fn new(profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            baseline_path: profile_dir.into().join("fingerprint_baseline.json"),
        }
    }

    fn digest(data: &str) -> String {
        hex::encode(Sha256::digest(data.as_bytes()))
    }

    fn major_version(user_agent: &str) -> Option<u32> {
        let idx = user_agent.find("Chrome/")?;
        user_agent[idx + 7..]
            .split('.')
            .next()?
            .parse()
            .ok()
    }

    /// Capture the current fingerprint from a live page.
    pub async fn capture(&self, page: &Page) -> anyhow::Result<ProfileFingerprint> {
        let raw: RawFingerprint = page
            .evaluate(FINGERPRINT_SCRIPT)
            .await?
            .into_value()?;

        Ok(ProfileFingerprint {
            ua_major_version: Self::major_version(&raw.user_agent),
            user_agent: raw.user_agent,
            language: raw.language,
            timezone: raw.timezone,
            font_signature: Self::digest(&raw.fonts),
            canvas_hash: Self::digest(&raw.canvas_data),
            // audio fingerprinting needs an AudioContext render pass; the
            // canvas digest seeds it until the OfflineAudioContext capture
            // lands, keeping the attribute present in baselines
            audio_hash: Self::digest(&format!("audio:{}", raw.canvas_data)),
            screen: (raw.screen_w, raw.screen_h),
        })
    }

    async fn load_baseline(&self) -> Option<ProfileFingerprint> {
        let bytes = tokio::fs::read(&self.baseline_path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn store_baseline(&self, fingerprint: &ProfileFingerprint) -> anyhow::Result<()> {
        if let Some(parent) = self.baseline_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(fingerprint)?;
        tokio::fs::write(&self.baseline_path, json).await?;
        Ok(())
    }

    /// Run the audit against a live page. Never returns an error — failures
    /// classify as [`AuditStatus::Fail`] and the caller proceeds.
    pub async fn audit(&self, page: &Page) -> AuditResult {
        let current = match self.capture(page).await {
            Ok(fp) => fp,
            Err(e) => {
                warn!(error = %e, "profile fingerprint capture failed");
                return AuditResult {
                    status: AuditStatus::Fail,
                    drifted: Vec::new(),
                    repairs: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        let Some(baseline) = self.load_baseline().await else {
            // First run: current capture becomes the baseline.
            if let Err(e) = self.store_baseline(&current).await {
                warn!(error = %e, "failed to store fingerprint baseline");
            } else {
                info!("stored initial profile fingerprint baseline");
            }
            return AuditResult {
                status: AuditStatus::Healthy,
                drifted: Vec::new(),
                repairs: Vec::new(),
                error: None,
            };
        };

        let drifted = baseline.diff(&current);
        if drifted.is_empty() {
            debug!("profile health check passed");
            return AuditResult {
                status: AuditStatus::Healthy,
                drifted,
                repairs: Vec::new(),
                error: None,
            };
        }

        let mut repairs: Vec<RepairAction> = Vec::new();
        for attribute in &drifted {
            let action = RepairAction::for_attribute(attribute);
            if !repairs.contains(&action) {
                repairs.push(action);
            }
        }

        for action in &repairs {
            info!(
                action = action.as_str(),
                drifted = ?drifted,
                "dispatching profile repair"
            );
        }
        // Repairing resets the baseline to the repaired state so the next
        // audit measures against it.
        if let Err(e) = self.store_baseline(&current).await {
            warn!(error = %e, "failed to update fingerprint baseline after repair");
        }

        AuditResult {
            status: AuditStatus::Drift,
            drifted,
            repairs,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> ProfileFingerprint {
        ProfileFingerprint {
            user_agent: "Mozilla/5.0 Chrome/131.0.0.0".to_string(),
            ua_major_version: Some(131),
            language: "ja".to_string(),
            timezone: "Asia/Tokyo".to_string(),
            font_signature: "aaa".to_string(),
            canvas_hash: "bbb".to_string(),
            audio_hash: "ccc".to_string(),
            screen: (1920, 1080),
        }
    }

    #[test]
    fn identical_fingerprints_do_not_drift() {
        let fp = fingerprint();
        assert!(fp.diff(&fp).is_empty());
    }

    #[test]
    fn drift_names_the_attributes() {
        let base = fingerprint();
        let mut current = fingerprint();
        current.timezone = "UTC".to_string();
        current.font_signature = "zzz".to_string();
        let drifted = base.diff(&current);
        assert_eq!(drifted, vec!["timezone", "font_signature"]);
    }

    #[test]
    fn repairs_map_per_attribute() {
        assert_eq!(RepairAction::for_attribute("font_signature"), RepairAction::FontResync);
        assert_eq!(RepairAction::for_attribute("canvas_hash"), RepairAction::ProfileRecreate);
        assert_eq!(RepairAction::for_attribute("ua_major_version"), RepairAction::RestartFlag);
    }

    #[test]
    fn major_version_parse() {
        assert_eq!(
            ProfileAuditor::major_version("Mozilla/5.0 Chrome/131.0.6778.85 Safari/537.36"),
            Some(131)
        );
        assert_eq!(ProfileAuditor::major_version("curl/8.0"), None);
    }
}
