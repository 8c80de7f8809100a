//! Allow-list policy backed by a plain text file.
//!
//! One card per line as `number: comment`; lines starting with `;` and
//! blank lines are skipped:
//!
//! ```text
//! ; front door
//! 1234567890: alice
//! 42: spare key fob
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use zamek::logging::AUDIT_TARGET;
use zamek::{CardCode, Capability, CapabilitySet, Decider, Policy, PolicyError, Zone};

const COMMENT_PREFIX: char = ';';

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardList {
    cards: BTreeMap<CardCode, String>,
}

impl CardList {
    pub fn parse(content: &str) -> Self {
        let mut cards = BTreeMap::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(COMMENT_PREFIX) {
                continue;
            }

            let (number, comment) = match line.split_once(':') {
                Some((number, comment)) => (number.trim(), comment.trim()),
                None => (line, ""),
            };
            match number.parse::<CardCode>() {
                Ok(card) => {
                    cards.insert(card, comment.to_string());
                }
                Err(_) => {
                    tracing::warn!(line = index + 1, entry = %number, "Skipping unreadable card entry");
                }
            }
        }
        Self { cards }
    }

    pub async fn load(path: &Path) -> Result<Self, PolicyError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PolicyError::lookup(format!("reading {}: {e}", path.display())))?;
        Ok(Self::parse(&content))
    }

    pub fn contains(&self, card: CardCode) -> bool {
        self.cards.contains_key(&card)
    }

    pub fn comment(&self, card: CardCode) -> Option<&str> {
        self.cards.get(&card).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Accepts listed cards and rejects the rest. The file is read on every
/// attempt, so edits apply without a restart.
#[derive(Debug, Clone)]
pub struct CardListPolicy {
    path: PathBuf,
}

impl CardListPolicy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Policy for CardListPolicy {
    fn name(&self) -> &str {
        "card-list"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::from([Capability::CardRead])
    }

    async fn on_card_read(
        &self,
        zone: Zone,
        cardcode: CardCode,
        decider: &Decider,
    ) -> Result<(), PolicyError> {
        let list = CardList::load(&self.path).await?;
        match list.comment(cardcode) {
            Some(holder) => {
                tracing::info!(target: AUDIT_TARGET, %zone, cardcode, holder, "Card accepted");
                decider.accept(zone).await?;
            }
            None => {
                tracing::info!(target: AUDIT_TARGET, %zone, cardcode, "Card not listed, rejected");
                decider.reject(zone).await?;
            }
        }
        Ok(())
    }
}
