use crate::entity::has_component;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub mod reload;


/// What an operation does, for rule matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Timeline,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Timeline => "timeline",
        }
    }
}

/// Who is calling. The in-process loopback transport is the only peer the
/// gate exempts; a TCP connection from 127.0.0.1 is still `Remote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    InProcess,
    Remote(IpAddr),
}

/// One evaluation request.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub action: Action,
    pub peer: Peer,
    /// Set when the action concerns a specific entity.
    pub entity_id: Option<&'a str>,
    /// Component presence bitmap of that entity, 0 otherwise.
    pub components: u32,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: &'static str,
}

// --- rule module file -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    default: Option<String>,
    #[serde(default, rename = "rule")]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    /// "read" | "write" | "timeline" | "any" (default).
    #[serde(default)]
    action: Option<String>,
    /// "loopback" | "*" | exact IP address (default "*").
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    id_regex: Option<String>,
    /// Component ordinals that must all be present on the entity.
    #[serde(default)]
    components: Vec<u32>,
    /// "allow" | "deny".
    effect: String,
}

#[derive(Debug)]
enum SourceMatch {
    Any,
    Loopback,
    Ip(IpAddr),
}

#[derive(Debug)]
struct CompiledRule {
    action: Option<Action>,
    source: SourceMatch,
    id: Option<Regex>,
    components: Vec<u32>,
    allow: bool,
}

impl CompiledRule {
    fn matches(&self, input: &PolicyInput<'_>) -> bool {
        if let Some(action) = self.action {
            if action != input.action {
                return false;
            }
        }
        match &self.source {
            SourceMatch::Any => {}
            SourceMatch::Loopback => match input.peer {
                Peer::Remote(ip) if ip.is_loopback() => {}
                _ => return false,
            },
            SourceMatch::Ip(ip) => match input.peer {
                Peer::Remote(peer) if peer == *ip => {}
                _ => return false,
            },
        }
        if let Some(regex) = &self.id {
            match input.entity_id {
                Some(id) if regex.is_match(id) => {}
                _ => return false,
            }
        }
        for ordinal in &self.components {
            if !has_component(input.components, *ordinal) {
                return false;
            }
        }
        true
    }
}

/// A compiled rule module: ordered rules, first match wins, default applies
/// otherwise (deny unless the file says `default = "allow"`).
#[derive(Debug)]
pub struct RuleSet {
    default_allow: bool,
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compiles rule module text. Any parse or regex error fails the whole
    /// module; the gate then keeps whatever it had before.
    pub fn compile(text: &str) -> Result<Self> {
        let file: RuleFile = toml::from_str(text).context("rule module does not parse")?;

        let default_allow = match file.default.as_deref() {
            None | Some("deny") => false,
            Some("allow") => true,
            Some(other) => anyhow::bail!("unknown default verdict '{other}'"),
        };

        let mut rules = Vec::with_capacity(file.rules.len());
        for (index, spec) in file.rules.into_iter().enumerate() {
            let action = match spec.action.as_deref() {
                None | Some("any") => None,
                Some("read") => Some(Action::Read),
                Some("write") => Some(Action::Write),
                Some("timeline") => Some(Action::Timeline),
                Some(other) => anyhow::bail!("rule {index}: unknown action '{other}'"),
            };
            let source = match spec.source.as_deref() {
                None | Some("*") => SourceMatch::Any,
                Some("loopback") => SourceMatch::Loopback,
                Some(ip) => SourceMatch::Ip(
                    ip.parse()
                        .with_context(|| format!("rule {index}: bad source ip '{ip}'"))?,
                ),
            };
            let id = spec
                .id_regex
                .as_deref()
                .map(Regex::new)
                .transpose()
                .with_context(|| format!("rule {index}: bad id regex"))?;
            let allow = match spec.effect.as_str() {
                "allow" => true,
                "deny" => false,
                other => anyhow::bail!("rule {index}: unknown effect '{other}'"),
            };
            rules.push(CompiledRule {
                action,
                source,
                id,
                components: spec.components,
                allow,
            });
        }

        Ok(Self {
            default_allow,
            rules,
        })
    }

    /// Everything allowed; used when no rule module is configured.
    pub fn permissive() -> Self {
        Self {
            default_allow: true,
            rules: Vec::new(),
        }
    }

    pub fn evaluate(&self, input: &PolicyInput<'_>) -> Decision {
        for rule in &self.rules {
            if rule.matches(input) {
                return Decision {
                    allowed: rule.allow,
                    reason: if rule.allow { "rule allow" } else { "rule deny" },
                };
            }
        }
        Decision {
            allowed: self.default_allow,
            reason: if self.default_allow {
                "default allow"
            } else {
                "default deny"
            },
        }
    }
}

/// The per-call authorization hook. Holds the active ruleset behind an
/// atomic pointer swap: readers clone the `Arc` at the start of `evaluate`
/// and never synchronize further.
pub struct PolicyGate {
    current: RwLock<Arc<RuleSet>>,
    path: Option<PathBuf>,
}

impl PolicyGate {
    /// Gate with no rule module: allows everything.
    pub fn permissive() -> Self {
        Self {
            current: RwLock::new(Arc::new(RuleSet::permissive())),
            path: None,
        }
    }

    /// Loads the rule module at `path`. A file that fails to load or
    /// compile here fails startup.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy file {}", path.display()))?;
        let rules = RuleSet::compile(&text)
            .with_context(|| format!("compiling policy file {}", path.display()))?;
        Ok(Self {
            current: RwLock::new(Arc::new(rules)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-reads the rule module. On any failure the previous ruleset stays
    /// in force and the error is returned for logging; the gate never
    /// becomes unloaded at runtime.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy file {}", path.display()))?;
        let rules = RuleSet::compile(&text)
            .with_context(|| format!("compiling policy file {}", path.display()))?;
        *self.current.write().expect("policy lock poisoned") = Arc::new(rules);
        Ok(())
    }

    pub fn evaluate(&self, input: &PolicyInput<'_>) -> Decision {
        // The in-process transport is exempt by identity, not by rule.
        if input.peer == Peer::InProcess {
            return Decision {
                allowed: true,
                reason: "in-process loopback",
            };
        }
        let rules = Arc::clone(&self.current.read().expect("policy lock poisoned"));
        rules.evaluate(input)
    }
}
