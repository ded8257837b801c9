//! 多投票者共识
//!
//! 选票按 flow 名分组（保持首次出现顺序），票数最多的组胜出，平票取先出现者。
//! 置信度：全票一致（且至少 2 票）时组内平均值加成并封顶 1.0；
//! 胜出组达到半数时取平均值；否则按惩罚系数缩放。

use std::collections::HashMap;

use serde_json::Value;

use crate::dialogue::Prediction;
use crate::nlu::VoteCandidate;

/// 共识参数（来自 [thresholds]）
#[derive(Debug, Clone, Copy)]
pub struct ConsensusParams {
    pub agreement_bonus: f64,
    pub disagreement_penalty: f64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            agreement_bonus: 0.1,
            disagreement_penalty: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    pub flow_name: String,
    pub confidence: f64,
    /// 取自胜出组中置信度最高的一票
    pub slots: HashMap<String, Value>,
    pub predictions: Vec<Prediction>,
    pub total_votes: usize,
    pub winner_votes: usize,
}

impl Consensus {
    pub fn unanimous(&self) -> bool {
        self.total_votes >= 2 && self.winner_votes == self.total_votes
    }

    pub fn has_majority(&self) -> bool {
        self.winner_votes * 2 >= self.total_votes
    }

    /// 胜出组票数严格过半
    pub fn has_strict_majority(&self) -> bool {
        self.winner_votes * 2 > self.total_votes
    }
}

struct Group<'a> {
    flow_name: &'a str,
    votes: Vec<&'a VoteCandidate>,
}

impl Group<'_> {
    fn average(&self) -> f64 {
        self.votes.iter().map(|v| v.confidence).sum::<f64>() / self.votes.len() as f64
    }
}

/// 统计选票；没有任何有效票时返回 None
pub fn tally(votes: &[VoteCandidate], params: ConsensusParams) -> Option<Consensus> {
    let mut groups: Vec<Group<'_>> = Vec::new();
    for vote in votes {
        match groups.iter_mut().find(|g| g.flow_name == vote.flow_name) {
            Some(group) => group.votes.push(vote),
            None => groups.push(Group {
                flow_name: &vote.flow_name,
                votes: vec![vote],
            }),
        }
    }

    let mut winner_idx = 0;
    for (idx, group) in groups.iter().enumerate().skip(1) {
        if group.votes.len() > groups[winner_idx].votes.len() {
            winner_idx = idx;
        }
    }
    let winner = groups.get(winner_idx)?;

    let total = votes.len();
    let count = winner.votes.len();
    let average = winner.average();
    let confidence = if total >= 2 && count == total {
        (average + params.agreement_bonus).min(1.0)
    } else if count * 2 >= total {
        average
    } else {
        average * params.disagreement_penalty
    };

    let best = winner
        .votes
        .iter()
        .copied()
        .fold(None::<&VoteCandidate>, |best, v| match best {
            Some(b) if b.confidence >= v.confidence => Some(b),
            _ => Some(v),
        })?;

    let mut ranked: Vec<(usize, &Group<'_>)> = groups.iter().enumerate().collect();
    // 胜出组固定排第一，其余按票数、平均置信度、出现顺序
    ranked.sort_by(|(ia, a), (ib, b)| {
        (*ib == winner_idx)
            .cmp(&(*ia == winner_idx))
            .then(b.votes.len().cmp(&a.votes.len()))
            .then(b.average().total_cmp(&a.average()))
            .then(ia.cmp(ib))
    });
    let predictions = ranked
        .into_iter()
        .take(3)
        .map(|(_, g)| Prediction {
            flow_name: g.flow_name.to_string(),
            confidence: g.average(),
        })
        .collect();

    Some(Consensus {
        flow_name: winner.flow_name.to_string(),
        confidence: confidence.clamp(0.0, 1.0),
        slots: best.slots.clone(),
        predictions,
        total_votes: total,
        winner_votes: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(flow: &str, confidence: f64, slot: Option<&str>) -> VoteCandidate {
        let mut slots = HashMap::new();
        if let Some(s) = slot {
            slots.insert("query".to_string(), Value::from(s));
        }
        VoteCandidate {
            flow_name: flow.to_string(),
            confidence,
            slots,
        }
    }

    #[test]
    fn test_unanimous_boost_and_best_slots() {
        let votes = [vote("search", 0.7, Some("low")), vote("search", 0.9, Some("high"))];
        let c = tally(&votes, ConsensusParams::default()).unwrap();
        assert!(c.unanimous());
        assert!((c.confidence - 0.9).abs() < 1e-9);
        assert_eq!(c.slots["query"], "high");
    }

    #[test]
    fn test_unanimous_capped_and_order_independent() {
        let a = [vote("plot", 0.95, None), vote("plot", 1.0, None)];
        let b = [vote("plot", 1.0, None), vote("plot", 0.95, None)];
        let ca = tally(&a, ConsensusParams::default()).unwrap();
        let cb = tally(&b, ConsensusParams::default()).unwrap();
        assert_eq!(ca.confidence, 1.0);
        assert_eq!(ca.confidence, cb.confidence);
        assert_eq!(ca.flow_name, cb.flow_name);
    }

    #[test]
    fn test_tie_goes_to_first_discovered_at_plain_average() {
        let votes = [vote("search", 0.6, None), vote("plot", 0.9, None)];
        let c = tally(&votes, ConsensusParams::default()).unwrap();
        assert_eq!(c.flow_name, "search");
        assert!((c.confidence - 0.6).abs() < 1e-9);
        assert_eq!(c.predictions[0].flow_name, "search");
        assert_eq!(c.predictions[1].flow_name, "plot");
        assert_eq!(c.predictions.len(), 2);
    }

    #[test]
    fn test_minority_winner_is_penalized() {
        let votes = [vote("a", 0.9, None), vote("b", 0.5, None), vote("c", 0.5, None)];
        let c = tally(&votes, ConsensusParams::default()).unwrap();
        assert_eq!(c.flow_name, "a");
        assert!(!c.has_majority());
        assert!((c.confidence - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_single_vote_is_not_boosted() {
        let c = tally(&[vote("chat", 0.6, None)], ConsensusParams::default()).unwrap();
        assert!(!c.unanimous());
        assert!((c.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_no_votes() {
        assert!(tally(&[], ConsensusParams::default()).is_none());
    }
}
