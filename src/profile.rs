//! System-Profile Collector (spec.md §4.7).
//!
//! A fixed, five-question interactive flow that elicits the caller's Linux
//! distribution, version, package manager, shell, and desktop environment,
//! then normalizes "Auto-detect" and "I don't know" answers into concrete
//! values before persisting.

use crate::store::{LegacySystemProfile, SystemProfileData};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One labeled choice offered for a profile question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileOption {
    pub label: String,
    pub value: String,
}

/// One question in the fixed profile-collection set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileQuestion {
    pub field: &'static str,
    pub question: String,
    pub options: Vec<ProfileOption>,
}

fn opt(label: &str) -> ProfileOption {
    ProfileOption { label: label.to_string(), value: label.to_string() }
}

/// The fixed question set, in collection order (spec.md §4.7, also the
/// order S5 requires `agent:question` events to be emitted in).
pub fn question_set() -> Vec<ProfileQuestion> {
    vec![
        ProfileQuestion {
            field: "distro",
            question: "Which Linux distribution are you running?".to_string(),
            options: vec![
                opt("Ubuntu"), opt("Debian"), opt("Fedora"), opt("Arch"), opt("openSUSE"),
                opt("I don't know"),
            ],
        },
        ProfileQuestion {
            field: "version",
            question: "Which version?".to_string(),
            options: vec![opt("I don't know")],
        },
        ProfileQuestion {
            field: "packageManager",
            question: "Which package manager do you use?".to_string(),
            options: vec![
                opt("Auto-detect"), opt("apt"), opt("dnf"), opt("pacman"), opt("zypper"),
                opt("I don't know"),
            ],
        },
        ProfileQuestion {
            field: "shell",
            question: "Which shell do you use?".to_string(),
            options: vec![opt("Auto-detect"), opt("bash"), opt("zsh"), opt("fish"), opt("I don't know")],
        },
        ProfileQuestion {
            field: "desktopEnvironment",
            question: "Which desktop environment, if any?".to_string(),
            options: vec![
                opt("GNOME"), opt("KDE Plasma"), opt("XFCE"), opt("None (server)"), opt("I don't know"),
            ],
        },
    ]
}

const REQUIRED_FIELDS: &[&str] = &["distro", "packageManager", "shell", "desktopEnvironment"];

fn package_manager_for_distro(distro: &str) -> &'static str {
    let lower = distro.to_lowercase();
    if lower.contains("ubuntu") || lower.contains("debian") || lower.contains("mint") || lower.contains("pop") {
        "apt"
    } else if lower.contains("fedora") || lower.contains("centos") || lower.contains("rhel") {
        "dnf"
    } else if lower.contains("arch") || lower.contains("manjaro") {
        "pacman"
    } else if lower.contains("opensuse") {
        "zypper"
    } else {
        "apt"
    }
}

/// Normalizes a raw answer map into [`SystemProfileData`], applying the
/// post-processing rules: `Auto-detect` package manager derives from
/// distro, `Auto-detect` shell becomes `bash`, and `"I don't know"` becomes
/// `"Unknown"`.
pub fn normalize_answers(answers: &HashMap<&str, String>) -> SystemProfileData {
    let distro = normalize_unknown(answers.get("distro").cloned().unwrap_or_default());
    let version = normalize_unknown(answers.get("version").cloned().unwrap_or_default());

    let mut package_manager = answers.get("packageManager").cloned().unwrap_or_default();
    if package_manager == "Auto-detect" {
        package_manager = package_manager_for_distro(&distro).to_string();
    }
    let package_manager = normalize_unknown(package_manager);

    let mut shell = answers.get("shell").cloned().unwrap_or_default();
    if shell == "Auto-detect" {
        shell = "bash".to_string();
    }
    let shell = normalize_unknown(shell);

    let desktop_environment =
        normalize_unknown(answers.get("desktopEnvironment").cloned().unwrap_or_default());

    SystemProfileData {
        distro,
        version,
        package_manager,
        shell,
        desktop_environment,
        detected_at: chrono::Utc::now(),
    }
}

fn normalize_unknown(value: String) -> String {
    if value == "I don't know" {
        "Unknown".to_string()
    } else {
        value
    }
}

/// Builds the legacy mirror, with `"Unknown"` fields collapsed to `None`
/// (spec.md §4.7 persistence note).
pub fn to_legacy(profile: &SystemProfileData) -> LegacySystemProfile {
    fn present(value: &str) -> Option<String> {
        if value == "Unknown" || value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    LegacySystemProfile {
        distro: present(&profile.distro),
        version: present(&profile.version),
        package_manager: present(&profile.package_manager),
        shell: present(&profile.shell),
        desktop_environment: present(&profile.desktop_environment),
    }
}

/// A profile is "complete" iff all four required fields are present and
/// neither `"I don't know"` nor `"Auto-detect"` (spec.md §4.7).
pub fn is_complete(profile: &SystemProfileData) -> bool {
    let fields: HashMap<&str, &str> = [
        ("distro", profile.distro.as_str()),
        ("packageManager", profile.package_manager.as_str()),
        ("shell", profile.shell.as_str()),
        ("desktopEnvironment", profile.desktop_environment.as_str()),
    ]
    .into_iter()
    .collect();

    REQUIRED_FIELDS.iter().all(|field| {
        fields
            .get(field)
            .map(|v| !v.is_empty() && *v != "I don't know" && *v != "Auto-detect")
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers(pairs: &[(&str, &str)]) -> HashMap<&'static str, String> {
        pairs
            .iter()
            .map(|(k, v)| {
                let key: &'static str = match *k {
                    "distro" => "distro",
                    "version" => "version",
                    "packageManager" => "packageManager",
                    "shell" => "shell",
                    "desktopEnvironment" => "desktopEnvironment",
                    other => panic!("unexpected field {other}"),
                };
                (key, v.to_string())
            })
            .collect()
    }

    #[test]
    fn auto_detect_package_manager_derives_from_distro() {
        let answers = answers(&[
            ("distro", "Fedora"),
            ("version", "40"),
            ("packageManager", "Auto-detect"),
            ("shell", "bash"),
            ("desktopEnvironment", "GNOME"),
        ]);
        let profile = normalize_answers(&answers);
        assert_eq!(profile.package_manager, "dnf");
    }

    #[test]
    fn auto_detect_shell_becomes_bash() {
        let answers = answers(&[
            ("distro", "Ubuntu"),
            ("version", "22.04"),
            ("packageManager", "apt"),
            ("shell", "Auto-detect"),
            ("desktopEnvironment", "GNOME"),
        ]);
        let profile = normalize_answers(&answers);
        assert_eq!(profile.shell, "bash");
    }

    #[test]
    fn i_dont_know_becomes_unknown() {
        let answers = answers(&[
            ("distro", "I don't know"),
            ("version", "I don't know"),
            ("packageManager", "apt"),
            ("shell", "bash"),
            ("desktopEnvironment", "I don't know"),
        ]);
        let profile = normalize_answers(&answers);
        assert_eq!(profile.distro, "Unknown");
        assert_eq!(profile.desktop_environment, "Unknown");
        assert!(!is_complete(&profile));
    }

    #[test]
    fn complete_profile_requires_all_four_concrete_fields() {
        let answers = answers(&[
            ("distro", "Ubuntu"),
            ("version", "22.04"),
            ("packageManager", "apt"),
            ("shell", "bash"),
            ("desktopEnvironment", "GNOME"),
        ]);
        let profile = normalize_answers(&answers);
        assert!(is_complete(&profile));
    }

    #[test]
    fn question_set_has_five_fields_in_spec_order() {
        let fields: Vec<&str> = question_set().into_iter().map(|q| q.field).collect();
        assert_eq!(
            fields,
            vec!["distro", "version", "packageManager", "shell", "desktopEnvironment"]
        );
    }
}
