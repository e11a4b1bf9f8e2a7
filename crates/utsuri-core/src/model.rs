//! # BiLSTM-CRF Tagger
//!
//! Word embeddings -> sentence adaptation layer -> bidirectional LSTM ->
//! output adaptation layer -> label projection -> CRF. The adaptation
//! layers start as identity maps, so a freshly transferred model behaves
//! like its source until target data moves them.
//!
//! Parameter names follow a `scope/leaf` layout. The adaptation layers, the
//! projection and the CRF transitions are declared in
//! [`Partition::Adaptation`]; everything else is [`Partition::Base`].

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ops::sigmoid;
use tracing::debug;

use crate::context::GraphBuilder;
use crate::data::Sentence;
use crate::error::{Result, UtsuriError};
use crate::param::{Initializer, ParamStore, Partition};
use crate::tagging::{TagVocab, ViterbiDecoder};

/// Name of the word embedding table.
pub const EMBEDDINGS: &str = "words/_word_embeddings";
/// Scope of the label projection; sized by the tag set of the domain.
pub const PROJECTION_SCOPE: &str = "proj";
/// Name of the CRF transition matrix.
pub const TRANSITIONS: &str = "crf/transitions";

/// The interface the training core needs from a tagging architecture.
pub trait SequenceTagger {
    /// Mean negative log-likelihood of a labeled batch, as a scalar tensor.
    fn loss(&self, batch: &[Sentence]) -> Result<Tensor>;

    /// Best tag sequence for every sentence of the batch.
    fn predict(&self, batch: &[Sentence]) -> Result<Vec<Vec<u32>>>;
}

/// Hyper-parameters of a [`BiLstmCrfTagger`].
#[derive(Debug, Clone)]
pub struct TaggerConfig {
    pub vocab_size: usize,
    pub tags: TagVocab,
    pub dim_word: usize,
    pub hidden_size_lstm: usize,
    pub train_embeddings: bool,
    /// Row-major `[vocab_size, dim_word]` initial embeddings.
    pub pretrained_embeddings: Option<Vec<f32>>,
}

struct Dense {
    weight: Var,
    bias: Var,
}

impl Dense {
    #[allow(clippy::too_many_arguments)]
    fn declare(
        params: &mut ParamStore,
        scope: &str,
        in_dim: usize,
        out_dim: usize,
        partition: Partition,
        weight_init: Initializer,
        bias_init: Initializer,
    ) -> Result<Self> {
        Ok(Self {
            weight: params.declare(format!("{scope}/W"), &[in_dim, out_dim], partition, weight_init)?,
            bias: params.declare(format!("{scope}/b"), &[out_dim], partition, bias_init)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs
            .matmul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?)
    }
}

struct LstmCell {
    kernel: Var,
    recurrent: Var,
    bias: Var,
    hidden: usize,
}

impl LstmCell {
    fn declare(params: &mut ParamStore, scope: &str, in_dim: usize, hidden: usize) -> Result<Self> {
        let gates = 4 * hidden;
        Ok(Self {
            kernel: params.declare(
                format!("{scope}/kernel"),
                &[in_dim, gates],
                Partition::Base,
                Initializer::GlorotUniform,
            )?,
            recurrent: params.declare(
                format!("{scope}/recurrent_kernel"),
                &[hidden, gates],
                Partition::Base,
                Initializer::GlorotUniform,
            )?,
            bias: params.declare(format!("{scope}/bias"), &[gates], Partition::Base, Initializer::Zeros)?,
            hidden,
        })
    }

    /// Run over `[seq_len, in_dim]` and return `[seq_len, hidden]` states,
    /// aligned with the input positions in both directions.
    fn run(&self, xs: &Tensor, reverse: bool) -> Result<Tensor> {
        let seq_len = xs.dim(0)?;
        let projected = xs
            .matmul(self.kernel.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?;

        let mut h = Tensor::zeros((1, self.hidden), DType::F32, xs.device())?;
        let mut c = h.clone();
        let mut outputs = Vec::with_capacity(seq_len);

        let order: Vec<usize> = if reverse {
            (0..seq_len).rev().collect()
        } else {
            (0..seq_len).collect()
        };
        for t in order {
            let gates = (projected.narrow(0, t, 1)? + h.matmul(self.recurrent.as_tensor())?)?;
            let gates = gates.chunk(4, 1)?;
            let input = sigmoid(&gates[0])?;
            // Forget bias of 1.0 keeps early gradients flowing through the cell.
            let forget = sigmoid(&(&gates[1] + 1.0)?)?;
            let candidate = gates[2].tanh()?;
            let output = sigmoid(&gates[3])?;
            c = ((forget * &c)? + (input * candidate)?)?;
            h = (output * c.tanh()?)?;
            outputs.push(h.clone());
        }

        if reverse {
            outputs.reverse();
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }
}

fn log_sum_exp(xs: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let shifted = xs.broadcast_sub(&max)?;
    (shifted.exp()?.sum_keepdim(dim)?.log()? + max)?.squeeze(dim)
}

/// Negative log-likelihood of `tags` under a linear-chain CRF.
///
/// `emissions` is `[seq_len, num_tags]`, `transitions` is `[num_tags, num_tags]`
/// indexed `[prev, curr]`. Returns a scalar tensor.
pub fn crf_negative_log_likelihood(emissions: &Tensor, transitions: &Tensor, tags: &[u32]) -> Result<Tensor> {
    let (seq_len, num_tags) = emissions.dims2()?;
    if tags.len() != seq_len {
        return Err(UtsuriError::Configuration(format!(
            "tag sequence length {} does not match {seq_len} emissions",
            tags.len()
        )));
    }
    if let Some(bad) = tags.iter().find(|&&t| t as usize >= num_tags) {
        return Err(UtsuriError::Configuration(format!(
            "tag id {bad} out of range for {num_tags} tags"
        )));
    }
    let device = emissions.device();

    // Score of the gold path.
    let mut emit_mask = vec![0.0f32; seq_len * num_tags];
    for (t, &tag) in tags.iter().enumerate() {
        emit_mask[t * num_tags + tag as usize] = 1.0;
    }
    let mut trans_counts = vec![0.0f32; num_tags * num_tags];
    for pair in tags.windows(2) {
        trans_counts[pair[0] as usize * num_tags + pair[1] as usize] += 1.0;
    }
    let emit_mask = Tensor::from_vec(emit_mask, (seq_len, num_tags), device)?;
    let trans_counts = Tensor::from_vec(trans_counts, (num_tags, num_tags), device)?;
    let gold = ((emissions * &emit_mask)?.sum_all()? + (transitions * &trans_counts)?.sum_all()?)?;

    // Log partition function (forward algorithm).
    let mut alpha = emissions.get(0)?;
    for t in 1..seq_len {
        let scores = alpha.unsqueeze(1)?.broadcast_add(transitions)?;
        alpha = (log_sum_exp(&scores, 0)? + emissions.get(t)?)?;
    }
    let log_z = log_sum_exp(&alpha, 0)?;

    Ok((log_z - gold)?)
}

/// Embeddings + BiLSTM + adaptation layers + CRF.
pub struct BiLstmCrfTagger {
    embeddings: Var,
    sentence_adapt: Dense,
    forward_cell: LstmCell,
    backward_cell: LstmCell,
    output_adapt: Dense,
    proj: Dense,
    transitions: Var,
    tags: TagVocab,
    decoder: ViterbiDecoder,
    device: Device,
}

impl GraphBuilder for TaggerConfig {
    type Graph = BiLstmCrfTagger;

    fn build(&self, params: &mut ParamStore) -> Result<BiLstmCrfTagger> {
        let num_tags = self.tags.len();
        if num_tags == 0 || self.vocab_size == 0 || self.dim_word == 0 || self.hidden_size_lstm == 0 {
            return Err(UtsuriError::Configuration(format!(
                "tagger dimensions must be positive (vocab {}, tags {num_tags}, dim_word {}, hidden {})",
                self.vocab_size, self.dim_word, self.hidden_size_lstm
            )));
        }
        let (dim, hidden) = (self.dim_word, self.hidden_size_lstm);

        let embeddings = params.declare_with(
            EMBEDDINGS,
            &[self.vocab_size, dim],
            Partition::Base,
            Initializer::Uniform(0.1),
            self.train_embeddings,
        )?;
        if let Some(pretrained) = &self.pretrained_embeddings {
            if pretrained.len() != self.vocab_size * dim {
                return Err(UtsuriError::Configuration(format!(
                    "pretrained embeddings hold {} values, expected {}x{dim}",
                    pretrained.len(),
                    self.vocab_size
                )));
            }
            let table = Tensor::from_slice(pretrained.as_slice(), (self.vocab_size, dim), params.device())?;
            embeddings.set(&table)?;
        }

        let sentence_adapt = Dense::declare(
            params,
            "sentence_adapt",
            dim,
            dim,
            Partition::Adaptation,
            Initializer::Identity,
            Initializer::Zeros,
        )?;
        let forward_cell = LstmCell::declare(params, "bi-lstm/fw", dim, hidden)?;
        let backward_cell = LstmCell::declare(params, "bi-lstm/bw", dim, hidden)?;
        let output_adapt = Dense::declare(
            params,
            "output_adapt",
            2 * hidden,
            2 * hidden,
            Partition::Adaptation,
            Initializer::Identity,
            Initializer::Zeros,
        )?;
        let proj = Dense::declare(
            params,
            PROJECTION_SCOPE,
            2 * hidden,
            num_tags,
            Partition::Adaptation,
            Initializer::GlorotUniform,
            Initializer::Uniform(0.05),
        )?;
        let transitions = params.declare(
            TRANSITIONS,
            &[num_tags, num_tags],
            Partition::Adaptation,
            Initializer::GlorotUniform,
        )?;

        debug!(parameters = params.len(), num_tags, "built BiLSTM-CRF graph");
        Ok(BiLstmCrfTagger {
            embeddings,
            sentence_adapt,
            forward_cell,
            backward_cell,
            output_adapt,
            proj,
            transitions,
            tags: self.tags.clone(),
            decoder: ViterbiDecoder::new(num_tags),
            device: params.device().clone(),
        })
    }
}

impl BiLstmCrfTagger {
    pub fn tags(&self) -> &TagVocab {
        &self.tags
    }

    /// Per-token label scores `[seq_len, num_tags]`.
    pub fn emissions(&self, sentence: &Sentence) -> Result<Tensor> {
        let ids = Tensor::new(sentence.word_ids.as_slice(), &self.device)?;
        let embedded = self.embeddings.as_tensor().index_select(&ids, 0)?;
        let adapted = self.sentence_adapt.forward(&embedded)?;
        let fw = self.forward_cell.run(&adapted, false)?;
        let bw = self.backward_cell.run(&adapted, true)?;
        let hidden = Tensor::cat(&[&fw, &bw], 1)?;
        let hidden = self.output_adapt.forward(&hidden)?;
        self.proj.forward(&hidden)
    }
}

impl SequenceTagger for BiLstmCrfTagger {
    fn loss(&self, batch: &[Sentence]) -> Result<Tensor> {
        let mut losses = Vec::with_capacity(batch.len());
        for sentence in batch.iter().filter(|s| !s.is_empty()) {
            let emissions = self.emissions(sentence)?;
            losses.push(crf_negative_log_likelihood(
                &emissions,
                self.transitions.as_tensor(),
                &sentence.tag_ids,
            )?);
        }
        if losses.is_empty() {
            return Ok(Tensor::new(0.0f32, &self.device)?);
        }
        Ok(Tensor::stack(&losses, 0)?.mean_all()?)
    }

    fn predict(&self, batch: &[Sentence]) -> Result<Vec<Vec<u32>>> {
        // Same unconstrained CRF the loss trains; the learned transitions
        // carry the tag-scheme constraints.
        let transitions = self.transitions.as_tensor().to_vec2::<f32>()?;
        batch
            .iter()
            .map(|sentence| {
                if sentence.is_empty() {
                    return Ok(Vec::new());
                }
                let emissions = self.emissions(sentence)?.to_vec2::<f32>()?;
                let path = self.decoder.decode(&emissions, &transitions)?;
                Ok(path.into_iter().map(|t| t as u32).collect())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Session;

    fn config() -> TaggerConfig {
        TaggerConfig {
            vocab_size: 6,
            tags: TagVocab::new(["O", "B-PER", "I-PER"]),
            dim_word: 4,
            hidden_size_lstm: 3,
            train_embeddings: true,
            pretrained_embeddings: None,
        }
    }

    fn sentence(word_ids: &[u32], tag_ids: &[u32]) -> Sentence {
        Sentence {
            words: word_ids.iter().map(|i| format!("w{i}")).collect(),
            word_ids: word_ids.to_vec(),
            tag_ids: tag_ids.to_vec(),
        }
    }

    #[test]
    fn test_parameter_layout_and_partitions() {
        let mut session = Session::new(Device::Cpu, 1);
        session.build(&config()).unwrap();
        let params = session.params();

        assert_eq!(params.get(EMBEDDINGS).unwrap().dims(), &[6, 4]);
        assert_eq!(params.get("proj/W").unwrap().dims(), &[6, 3]);
        assert_eq!(params.get(TRANSITIONS).unwrap().dims(), &[3, 3]);

        // Declared partitions agree with the name markers.
        for p in params.iter() {
            assert_eq!(p.partition(), Partition::from_name(p.name()), "{}", p.name());
        }
    }

    #[test]
    fn test_crf_nll_matches_brute_force() {
        let device = Device::Cpu;
        let em = vec![vec![0.3f32, -0.2], vec![1.0, 0.5], vec![-0.4, 0.9]];
        let tr = vec![vec![0.1f32, -0.3], vec![0.7, 0.2]];
        let emissions = Tensor::from_vec(em.concat(), (3, 2), &device).unwrap();
        let transitions = Tensor::from_vec(tr.concat(), (2, 2), &device).unwrap();
        let tags = [0u32, 1, 1];

        let nll = crf_negative_log_likelihood(&emissions, &transitions, &tags)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        let score = |path: &[usize]| -> f32 {
            let mut s = em[0][path[0]];
            for t in 1..path.len() {
                s += tr[path[t - 1]][path[t]] + em[t][path[t]];
            }
            s
        };
        let mut log_z_terms = Vec::new();
        for a in 0..2 {
            for b in 0..2 {
                for c in 0..2 {
                    log_z_terms.push(score(&[a, b, c]));
                }
            }
        }
        let log_z = log_z_terms.iter().map(|s| s.exp()).sum::<f32>().ln();
        let expected = log_z - score(&[0, 1, 1]);

        assert!((nll - expected).abs() < 1e-4, "{nll} vs {expected}");
    }

    #[test]
    fn test_crf_rejects_out_of_range_tags() {
        let device = Device::Cpu;
        let emissions = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        let transitions = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        assert!(crf_negative_log_likelihood(&emissions, &transitions, &[0, 5]).is_err());
    }

    #[test]
    fn test_loss_is_positive_scalar() {
        let mut session = Session::new(Device::Cpu, 2);
        let tagger = session.build(&config()).unwrap();
        let batch = vec![sentence(&[1, 2, 3], &[1, 2, 0]), sentence(&[4], &[0])];
        let loss = tagger.loss(&batch).unwrap();
        assert_eq!(loss.rank(), 0);
        assert!(loss.to_scalar::<f32>().unwrap() > 0.0);
    }

    #[test]
    fn test_gradient_descent_reduces_loss() {
        let mut session = Session::new(Device::Cpu, 3);
        let tagger = session.build(&config()).unwrap();
        let batch = vec![sentence(&[1, 2, 3, 4], &[1, 2, 0, 0])];

        let initial = tagger.loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        for _ in 0..30 {
            let loss = tagger.loss(&batch).unwrap();
            let grads = loss.backward().unwrap();
            for p in session.params().trainable() {
                if let Some(g) = grads.get(p.var().as_tensor()) {
                    let updated = (p.var().as_tensor() - (g * 0.1).unwrap()).unwrap();
                    p.var().set(&updated).unwrap();
                }
            }
        }
        let trained = tagger.loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        assert!(trained < initial, "{trained} >= {initial}");
    }

    fn expected_path(tagger: &BiLstmCrfTagger, sentence: &Sentence) -> Vec<u32> {
        let emissions = tagger.emissions(sentence).unwrap().to_vec2::<f32>().unwrap();
        let transitions = tagger.transitions.as_tensor().to_vec2::<f32>().unwrap();
        ViterbiDecoder::new(tagger.tags().len())
            .decode(&emissions, &transitions)
            .unwrap()
            .into_iter()
            .map(|t| t as u32)
            .collect()
    }

    #[test]
    fn test_predict_is_crf_viterbi() {
        let mut session = Session::new(Device::Cpu, 4);
        let tagger = session.build(&config()).unwrap();
        let batch = vec![sentence(&[1, 2, 3, 4, 5], &[]), sentence(&[], &[])];
        let preds = tagger.predict(&batch).unwrap();

        assert_eq!(preds[0].len(), 5);
        assert!(preds[1].is_empty());
        assert_eq!(preds[0], expected_path(&tagger, &batch[0]));
    }

    #[test]
    fn test_predict_io_scheme_can_open_entity_after_outside() {
        let mut cfg = config();
        cfg.tags = TagVocab::new(["O", "PER"]);
        let mut session = Session::new(Device::Cpu, 11);
        let tagger = session.build(&cfg).unwrap();
        // Make O -> PER the only rewarded transition.
        session
            .params()
            .assign(
                TRANSITIONS,
                &Tensor::new(&[[0.0f32, 50.0], [-50.0, -50.0]], &Device::Cpu).unwrap(),
            )
            .unwrap();

        let batch = vec![sentence(&[1, 2], &[])];
        let preds = tagger.predict(&batch).unwrap();
        assert_eq!(preds[0], vec![0, 1]);
    }

    #[test]
    fn test_pretrained_embeddings_are_loaded() {
        let mut cfg = config();
        cfg.pretrained_embeddings = Some((0..24).map(|v| v as f32).collect());
        let mut session = Session::new(Device::Cpu, 5);
        session.build(&cfg).unwrap();
        let values = session.params().get(EMBEDDINGS).unwrap().values().unwrap();
        assert_eq!(values[23], 23.0);
    }
}
