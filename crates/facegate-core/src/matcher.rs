//! Majority-vote matcher.
//!
//! Every reference embedding the provider accepts as a match casts one vote
//! for its label. The label with the most votes wins; on a tie the label that
//! was enrolled first wins.

use crate::provider::EmbeddingProvider;
use crate::store::EncodingStore;
use crate::types::{Embedding, ResolvedLabel};

/// Winning label and its vote count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote<'a> {
    pub label: &'a str,
    pub votes: usize,
}

/// Resolves probe embeddings against an [`EncodingStore`] by vote.
pub struct VoteMatcher;

impl VoteMatcher {
    /// Best-supported label for `probe`, or `None` when nothing matched.
    ///
    /// An empty store never matches.
    pub fn compare<'a, P: EmbeddingProvider + ?Sized>(
        &self,
        provider: &P,
        probe: &Embedding,
        store: &'a EncodingStore,
    ) -> Option<Vote<'a>> {
        if store.is_empty() {
            return None;
        }

        let verdicts = provider.are_matching(store.encodings(), probe);
        if verdicts.len() > store.len() {
            tracing::warn!(
                references = store.len(),
                verdicts = verdicts.len(),
                "provider returned more verdicts than references; extra verdicts ignored"
            );
        } else if verdicts.len() < store.len() {
            tracing::warn!(
                references = store.len(),
                verdicts = verdicts.len(),
                "provider returned fewer verdicts than references; trailing references cast no vote"
            );
        }

        // Insertion-ordered tally.
        let mut tally: Vec<Vote<'a>> = Vec::new();
        for (matched, name) in verdicts.iter().zip(store.names()) {
            if !matched {
                continue;
            }
            match tally.iter_mut().find(|vote| vote.label == name.as_str()) {
                Some(vote) => vote.votes += 1,
                None => tally.push(Vote { label: name, votes: 1 }),
            }
        }

        let mut best: Option<Vote<'a>> = None;
        for vote in tally {
            if best.map_or(true, |b| vote.votes > b.votes) {
                best = Some(vote);
            }
        }
        best
    }

    /// Same as [`compare`](Self::compare), mapped to a caption-ready label.
    pub fn resolve<P: EmbeddingProvider + ?Sized>(
        &self,
        provider: &P,
        probe: &Embedding,
        store: &EncodingStore,
    ) -> (ResolvedLabel, usize) {
        match self.compare(provider, probe, store) {
            Some(vote) => (ResolvedLabel::Known(vote.label.to_string()), vote.votes),
            None => (ResolvedLabel::Unknown, 0),
        }
    }
}
