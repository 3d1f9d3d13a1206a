//! Forecast trees: branch the self-attention model's top continuations a few
//! steps ahead, then feed surprising branches back into it.

use crate::predict::PredictionIndex;
use crate::predict::attention::softmax;

/// Branches expanded per node.
pub const BRANCHES: usize = 3;
/// Learning rate scale for [`backpropagate_forecast`].
pub const BACKPROP_RATE: f64 = 0.1;

/// One node of a forecast tree, exclusively owned by its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastNode {
    /// Space-joined token path from the root.
    pub text: String,
    /// Cumulative path probability.
    pub prob: f64,
    /// `1 - p` of the branch that produced this node.
    pub novelty: f64,
    pub children: Vec<ForecastNode>,
}

impl ForecastNode {
    pub fn tokens(&self) -> Vec<String> {
        self.text.split_whitespace().map(str::to_string).collect()
    }

    /// Total number of nodes in this subtree.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(ForecastNode::size).sum::<usize>()
    }
}

fn expand(
    index: &mut PredictionIndex,
    vocab: &[String],
    tokens: Vec<String>,
    remaining: usize,
    prob: f64,
) -> ForecastNode {
    let mut node = ForecastNode {
        text: tokens.join(" "),
        prob,
        novelty: 1.0 - prob,
        children: Vec::new(),
    };
    if remaining == 0 || vocab.is_empty() {
        return node;
    }
    let logits = index.transformer_logits(&tokens, vocab, None);
    let values: Vec<f64> = logits.iter().map(|(_, l)| *l).collect();
    let mut branches: Vec<(String, f64)> = logits
        .into_iter()
        .map(|(w, _)| w)
        .zip(softmax(&values))
        .collect();
    branches.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (word, p) in branches.into_iter().take(BRANCHES) {
        let mut next = tokens.clone();
        next.push(word);
        let mut child = expand(index, vocab, next, remaining - 1, prob * p);
        child.novelty = 1.0 - p;
        node.children.push(child);
    }
    node
}

/// Expand the top continuations of `seeds` over the index vocabulary for
/// `depth` steps.
pub fn simulate_paths(index: &mut PredictionIndex, seeds: &[String], depth: usize) -> ForecastNode {
    let vocab = index.sorted_vocab();
    expand(index, &vocab, seeds.to_vec(), depth, 1.0)
}

/// Train towards every node of the subtree that predicts at least one token,
/// with learning rate `0.1 × novelty`. Returns the number of steps applied.
pub fn backpropagate_forecast(index: &mut PredictionIndex, node: &ForecastNode) -> usize {
    let vocab = index.sorted_vocab();
    backprop(index, &vocab, node)
}

fn backprop(index: &mut PredictionIndex, vocab: &[String], node: &ForecastNode) -> usize {
    let mut steps = 0;
    let tokens = node.tokens();
    if let Some((target, context)) = tokens.split_last() {
        if !context.is_empty()
            && node.novelty > 0.0
            && index.train_transformer(vocab, context, target, BACKPROP_RATE * node.novelty)
        {
            steps += 1;
        }
    }
    for child in &node.children {
        steps += backprop(index, vocab, child);
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::Graph;

    fn index() -> PredictionIndex {
        let mut index = PredictionIndex::from_graph(Graph::new()).with_attention(4, 16);
        for line in ["sun rises east", "moon rises night", "sun sets west"] {
            let toks: Vec<String> = line.split(' ').map(str::to_string).collect();
            index.update(&toks).unwrap();
        }
        index
    }

    #[test]
    fn tree_has_three_branches_per_level() {
        let mut idx = index();
        let root = simulate_paths(&mut idx, &["sun".to_string()], 2);
        assert_eq!(root.text, "sun");
        assert_eq!(root.prob, 1.0);
        assert_eq!(root.children.len(), BRANCHES);
        assert_eq!(root.size(), 1 + 3 + 9);
        let child = &root.children[0];
        assert!(child.prob <= 1.0 && child.prob > 0.0);
        assert!((child.novelty - (1.0 - child.prob)).abs() < 1e-12);
        let grandchild = &child.children[0];
        assert!(grandchild.prob <= child.prob);
    }

    #[test]
    fn backprop_raises_branch_probability() {
        let mut idx = index();
        let seeds = vec!["sun".to_string()];
        let root = simulate_paths(&mut idx, &seeds, 1);
        let weakest = root.children.last().unwrap().clone();

        assert_eq!(backpropagate_forecast(&mut idx, &weakest), 1);

        let again = simulate_paths(&mut idx, &seeds, 1);
        let word = weakest.tokens().pop().unwrap();
        let fresh_p = |n: &ForecastNode| {
            n.children
                .iter()
                .find(|c| c.tokens().last() == Some(&word))
                .map(|c| c.prob)
                .unwrap_or(0.0)
        };
        assert!(fresh_p(&again) > weakest.prob);
    }

    #[test]
    fn root_alone_is_not_trained() {
        let mut idx = index();
        let root = simulate_paths(&mut idx, &["sun".to_string()], 0);
        assert_eq!(backpropagate_forecast(&mut idx, &root), 0);
    }
}
