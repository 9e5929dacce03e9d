//! Trust classification and the per-mode connection policies.
//!
//! A connection attempt presents `(bareName, publicKey)`. Against the
//! known-hosts table that pair falls into exactly one of seven categories;
//! the configured trust mode maps every category to one of four actions.
//! Classification is a pure function — classifying the same input twice
//! yields the same category.

use crate::identity::ANON_PREFIX;
use crate::keystore::KnownHosts;

/// The seven-way classification of a presented `(name, key)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrustCategory {
    /// Key known, name matches, no aliases, no competing key.
    TheOneAndOnly,
    /// Key known, name matches, and the key has other names too.
    KnownWithKnownAliases,
    /// Key known under exactly one other name; the presented name is new.
    PossibleNameChange,
    /// Key known under two or more other names; the presented name is new.
    PossibleSharedPubkey,
    /// Key known under other names while the presented name is bound to a
    /// different key.
    NameSwapCollision,
    /// Unknown key presented under a name we know with a different key.
    Pretender,
    /// Neither the key nor the name is known.
    NeverMet,
}

impl TrustCategory {
    /// Wire/label form of the category.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TheOneAndOnly => "theoneandonly",
            Self::KnownWithKnownAliases => "knownwithknownaliases",
            Self::PossibleNameChange => "possiblenamechange",
            Self::PossibleSharedPubkey => "possiblesharedpubkey",
            Self::NameSwapCollision => "nameswapcollision",
            Self::Pretender => "pretender",
            Self::NeverMet => "nevermet",
        }
    }
}

impl std::fmt::Display for TrustCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// What to do about a classified connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustAction {
    /// Do not open a connection.
    Reject,
    /// Ask before opening.
    PromptAndTrust,
    /// Open, then ask before saving the key.
    ConnectAndPrompt,
    /// Open and save the key automatically.
    ConnectAndTrust,
}

/// Classify a presented pair against the known-hosts table.
///
/// Anonymous-prefixed names never build identity and short-circuit to
/// [`TrustCategory::NeverMet`].
pub fn classify(bare_name: &str, presented_key: &str, hosts: &KnownHosts) -> TrustCategory {
    if bare_name.starts_with(ANON_PREFIX) {
        return TrustCategory::NeverMet;
    }

    let bound_key = hosts.get_public_key(bare_name);
    let names_for_key = hosts.peer_names_for_key(presented_key);

    if names_for_key.is_empty() {
        // Unknown key
        return if bound_key.is_some() {
            TrustCategory::Pretender
        } else {
            TrustCategory::NeverMet
        };
    }

    let name_matches = names_for_key.iter().any(|n| n == bare_name);
    if name_matches {
        if names_for_key.len() == 1 {
            TrustCategory::TheOneAndOnly
        } else {
            TrustCategory::KnownWithKnownAliases
        }
    } else if bound_key.is_some() {
        // Presented name is bound to some other key while the presented key
        // belongs to other names.
        TrustCategory::NameSwapCollision
    } else if names_for_key.len() == 1 {
        TrustCategory::PossibleNameChange
    } else {
        TrustCategory::PossibleSharedPubkey
    }
}

/// A named, total mapping from category to action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustMode {
    /// Prompt for anything not already known.
    Strict,
    /// Like strict, but prompts become rejects.
    StrictAndQuiet,
    /// Admit strangers with a post-connect prompt; prompt on conflicts.
    Moderate,
    /// Like moderate, without prompts: strangers are trusted, conflicts
    /// rejected.
    ModerateAndQuiet,
    /// Admit almost everyone; only collisions and pretenders prompt.
    Lax,
    /// Connect and trust everyone.
    Unsafe,
    /// Reject everyone.
    RejectAll,
    /// Prompt for everyone.
    AlwaysPrompt,
}

impl TrustMode {
    /// Parse a mode name (case-insensitive). Unknown names — including the
    /// historically unpopulated `doubleprompt` — fall back to `strict` with
    /// a warning.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "strict" => Self::Strict,
            "strictandquiet" => Self::StrictAndQuiet,
            "moderate" => Self::Moderate,
            "moderateandquiet" => Self::ModerateAndQuiet,
            "lax" => Self::Lax,
            "unsafe" => Self::Unsafe,
            "rejectall" => Self::RejectAll,
            "alwaysprompt" => Self::AlwaysPrompt,
            other => {
                log::warn!("[Trust] unknown trust mode {other:?}; using strict");
                Self::Strict
            }
        }
    }

    /// The action for a category under this mode. Total over both enums.
    pub fn action(&self, category: TrustCategory) -> TrustAction {
        use TrustAction::*;
        use TrustCategory::*;

        match self {
            Self::Strict => match category {
                TheOneAndOnly | KnownWithKnownAliases => ConnectAndTrust,
                PossibleNameChange | PossibleSharedPubkey | NameSwapCollision | Pretender
                | NeverMet => PromptAndTrust,
            },
            Self::StrictAndQuiet => match category {
                TheOneAndOnly | KnownWithKnownAliases => ConnectAndTrust,
                PossibleNameChange | PossibleSharedPubkey | NameSwapCollision | Pretender
                | NeverMet => Reject,
            },
            Self::Moderate => match category {
                TheOneAndOnly | KnownWithKnownAliases => ConnectAndTrust,
                NeverMet => ConnectAndPrompt,
                PossibleNameChange | PossibleSharedPubkey | NameSwapCollision | Pretender => {
                    PromptAndTrust
                }
            },
            Self::ModerateAndQuiet => match category {
                TheOneAndOnly | KnownWithKnownAliases | NeverMet => ConnectAndTrust,
                PossibleNameChange | PossibleSharedPubkey | NameSwapCollision | Pretender => Reject,
            },
            Self::Lax => match category {
                TheOneAndOnly | KnownWithKnownAliases | NeverMet => ConnectAndTrust,
                PossibleNameChange | PossibleSharedPubkey => ConnectAndPrompt,
                NameSwapCollision | Pretender => PromptAndTrust,
            },
            Self::Unsafe => ConnectAndTrust,
            Self::RejectAll => Reject,
            Self::AlwaysPrompt => PromptAndTrust,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use std::sync::Arc;

    fn hosts_with(entries: &[(&str, &str)]) -> KnownHosts {
        let hosts = KnownHosts::load(Arc::new(MemoryKv::new()));
        for (name, key) in entries {
            hosts.save_public_key(name, key, true).expect("seed");
        }
        hosts
    }

    #[test]
    fn test_classify_the_one_and_only() {
        let hosts = hosts_with(&[("bob", "K1")]);
        assert_eq!(classify("bob", "K1", &hosts), TrustCategory::TheOneAndOnly);
    }

    #[test]
    fn test_classify_known_with_aliases() {
        let hosts = hosts_with(&[("bob", "K1"), ("bobby", "K1")]);
        assert_eq!(
            classify("bob", "K1", &hosts),
            TrustCategory::KnownWithKnownAliases
        );
    }

    #[test]
    fn test_classify_possible_name_change() {
        let hosts = hosts_with(&[("bob", "K1")]);
        assert_eq!(
            classify("robert", "K1", &hosts),
            TrustCategory::PossibleNameChange
        );
    }

    #[test]
    fn test_classify_possible_shared_pubkey() {
        let hosts = hosts_with(&[("bob", "K1"), ("bobby", "K1")]);
        assert_eq!(
            classify("robert", "K1", &hosts),
            TrustCategory::PossibleSharedPubkey
        );
    }

    #[test]
    fn test_classify_name_swap_collision() {
        let hosts = hosts_with(&[("bob", "K1"), ("carol", "K2")]);
        // carol presents bob's key while "carol" is bound to K2
        assert_eq!(
            classify("carol", "K1", &hosts),
            TrustCategory::NameSwapCollision
        );
    }

    #[test]
    fn test_classify_pretender() {
        let hosts = hosts_with(&[("bob", "K1")]);
        assert_eq!(classify("bob", "K2", &hosts), TrustCategory::Pretender);
    }

    #[test]
    fn test_classify_never_met() {
        let hosts = hosts_with(&[("bob", "K1")]);
        assert_eq!(classify("carol", "K2", &hosts), TrustCategory::NeverMet);
    }

    #[test]
    fn test_classify_anon_short_circuits() {
        let hosts = hosts_with(&[("anon-cafe", "K1")]);
        // Even a known binding cannot rescue an anonymous name
        assert_eq!(classify("anon-cafe", "K1", &hosts), TrustCategory::NeverMet);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let hosts = hosts_with(&[("bob", "K1"), ("bobby", "K1"), ("carol", "K2")]);
        for name in ["bob", "bobby", "carol", "dave", "anon-1"] {
            for key in ["K1", "K2", "K3"] {
                assert_eq!(classify(name, key, &hosts), classify(name, key, &hosts));
            }
        }
    }

    #[test]
    fn test_strict_prompts_for_pretender() {
        // Strict mode meets a pretender: ask, never auto-connect.
        assert_eq!(
            TrustMode::Strict.action(TrustCategory::Pretender),
            TrustAction::PromptAndTrust
        );
    }

    #[test]
    fn test_quiet_modes_never_prompt() {
        use TrustCategory::*;
        for category in [
            TheOneAndOnly,
            KnownWithKnownAliases,
            PossibleNameChange,
            PossibleSharedPubkey,
            NameSwapCollision,
            Pretender,
            NeverMet,
        ] {
            for mode in [TrustMode::StrictAndQuiet, TrustMode::ModerateAndQuiet] {
                assert!(
                    !matches!(
                        mode.action(category),
                        TrustAction::PromptAndTrust | TrustAction::ConnectAndPrompt
                    ),
                    "{mode:?} prompted for {category:?}"
                );
            }
        }
    }

    #[test]
    fn test_degenerate_modes() {
        use TrustCategory::*;
        for category in [TheOneAndOnly, Pretender, NeverMet] {
            assert_eq!(
                TrustMode::Unsafe.action(category),
                TrustAction::ConnectAndTrust
            );
            assert_eq!(TrustMode::RejectAll.action(category), TrustAction::Reject);
            assert_eq!(
                TrustMode::AlwaysPrompt.action(category),
                TrustAction::PromptAndTrust
            );
        }
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!(TrustMode::parse("Strict"), TrustMode::Strict);
        assert_eq!(TrustMode::parse("MODERATE"), TrustMode::Moderate);
        assert_eq!(TrustMode::parse("rejectall"), TrustMode::RejectAll);
        // Unpopulated legacy mode falls back to strict
        assert_eq!(TrustMode::parse("doubleprompt"), TrustMode::Strict);
    }
}
