//! Training session: epochs over the train split with periodic dev
//! evaluation and checkpointing.

use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use tracing::{debug, info};

use crate::checkpoint::{CheckpointMeta, save_checkpoint};
use crate::config::TrainConfig;
use crate::data::{BatchLoader, Split, make_loader};
use crate::encoder::{PretrainedEncoder, load_pretrained_weights};
use crate::error::Result;
use crate::metrics::{EvalStats, binarize_labels, head, select_labeled, weighted_bce_with_logits};
use crate::model::FusionModel;
use crate::telemetry::ScalarLog;

/// Dev-split metrics produced by one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct DevMetrics {
    pub loss: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// All mutable training state, owned by one session for one run.
pub struct TrainSession {
    config: TrainConfig,
    device: Device,
    varmap: VarMap,
    model: FusionModel,
    optimizer: AdamW,
    telemetry: ScalarLog,
    n_iter: usize,
    n_prev_iter: usize,
    running_loss: f64,
}

impl TrainSession {
    /// Build the model on the best available device, initialize the encoder
    /// from its pretrained snapshot, and set up the optimizer and telemetry.
    pub fn new(config: TrainConfig) -> Result<Self> {
        let device = Device::cuda_if_available(0)?;
        info!(?device, "training device");
        if !device.is_cpu() {
            device.set_seed(config.seed)?;
        }

        let encoder_config = PretrainedEncoder::read_config(&config.encoder_dir)?;
        info!(
            hidden_size = encoder_config.hidden_size,
            layers = encoder_config.num_hidden_layers,
            "encoder config loaded from {}",
            config.encoder_dir.display()
        );

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = PretrainedEncoder::new(&encoder_config, vb.pp("encoder"))?;
        let model = FusionModel::new(Box::new(encoder), config.kb_dim, vb)?;

        let weights_path = config.encoder_dir.join("model.safetensors");
        let loaded = load_pretrained_weights(&varmap, &weights_path, "encoder.")?;
        info!(tensors = loaded, "pretrained encoder weights applied");

        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.lr,
                ..Default::default()
            },
        )?;

        let telemetry = ScalarLog::create(&config.telemetry_path)?;

        Ok(Self {
            config,
            device,
            varmap,
            model,
            optimizer,
            telemetry,
            n_iter: 0,
            n_prev_iter: 0,
            running_loss: 0.0,
        })
    }

    /// Run the full training loop to completion.
    pub fn run(&mut self) -> Result<()> {
        let mut train_loader = make_loader(
            &self.config.data_dir,
            Split::Train,
            self.config.batch_size,
            &self.device,
        )?;
        let mut dev_loader = make_loader(
            &self.config.data_dir,
            Split::Dev,
            self.config.dev_batch_size,
            &self.device,
        )?;
        info!(
            train_examples = train_loader.len(),
            dev_examples = dev_loader.len(),
            "datasets loaded"
        );

        for epoch in 0..self.config.epochs {
            train_loader.reshuffle(self.config.seed, epoch);

            let mut batch_idx = 0usize;
            while let Some(batch) = train_loader.next_batch()? {
                let batch = batch.to_device(&self.device)?;

                let logits = self
                    .model
                    .forward(&batch.tokens, &batch.attn_mask, &batch.kb_embs)?;
                let pred = select_labeled(&logits, &batch.output_mask)?;
                let truth = binarize_labels(&select_labeled(
                    &batch.labels.to_dtype(DType::F32)?,
                    &batch.output_mask,
                )?)?;

                let loss =
                    weighted_bce_with_logits(&pred, &truth, self.config.pos_weight)?;
                self.optimizer.backward_step(&loss)?;

                let loss_value = loss.to_scalar::<f32>()? as f64;
                self.n_iter += 1;
                self.running_loss += loss_value;
                self.telemetry
                    .scalar("loss/train_batch", self.n_iter, loss_value)?;

                if batch_idx % self.config.eval_interval == 0 {
                    debug!(
                        predictions = ?head(&pred, 8)?,
                        labels = ?head(&truth, 8)?,
                        "sample outputs"
                    );
                    let train_avg =
                        self.running_loss / (self.n_iter - self.n_prev_iter) as f64;
                    self.telemetry
                        .scalar("loss/train_avg", self.n_iter, train_avg)?;
                    self.n_prev_iter = self.n_iter;
                    self.running_loss = 0.0;

                    let dev = self.evaluate(&mut dev_loader)?;
                    info!(
                        epoch,
                        batch_idx,
                        train_avg,
                        dev_loss = dev.loss,
                        precision = dev.precision,
                        recall = dev.recall,
                        f1 = dev.f1,
                        "evaluation"
                    );
                    self.telemetry.scalar("loss/dev", self.n_iter, dev.loss)?;
                    self.telemetry
                        .scalar("precision/dev", self.n_iter, dev.precision)?;
                    self.telemetry
                        .scalar("recall/dev", self.n_iter, dev.recall)?;
                    self.telemetry.scalar("f1/dev", self.n_iter, dev.f1)?;

                    let meta = CheckpointMeta {
                        epoch,
                        step: self.n_iter,
                        batch_size: self.config.batch_size,
                        lr: self.config.lr,
                        pos_weight: self.config.pos_weight,
                        dev_loss: dev.loss,
                        f1: dev.f1,
                    };
                    let path = save_checkpoint(
                        &self.config.checkpoint_dir,
                        &self.varmap,
                        batch_idx,
                        &meta,
                    )?;
                    info!("checkpoint written to {}", path.display());
                }
                batch_idx += 1;
            }
        }

        info!("training complete");
        Ok(())
    }

    /// Full pass over the dev split, gradients detached.
    pub fn evaluate(&self, dev_loader: &mut BatchLoader) -> Result<DevMetrics> {
        let mut stats = EvalStats::new();
        dev_loader.reset();

        while let Some(batch) = dev_loader.next_batch()? {
            let batch = batch.to_device(&self.device)?;
            let logits = self
                .model
                .forward(&batch.tokens, &batch.attn_mask, &batch.kb_embs)?
                .detach();
            let pred = select_labeled(&logits, &batch.output_mask)?;
            let truth = binarize_labels(&select_labeled(
                &batch.labels.to_dtype(DType::F32)?,
                &batch.output_mask,
            )?)?;

            let loss = weighted_bce_with_logits(&pred, &truth, self.config.pos_weight)?
                .to_scalar::<f32>()? as f64;

            let pred_host: Vec<f32> = pred.to_vec1()?;
            let truth_host: Vec<f32> = truth.to_vec1()?;
            stats.update(&pred_host, &truth_host, loss);
        }

        debug!(
            pred_positive = stats.pred_positive,
            truth_positive = stats.truth_positive,
            examples = stats.examples,
            hits = stats.hits,
            "dev counters"
        );

        Ok(DevMetrics {
            loss: stats.avg_loss(),
            precision: stats.precision(),
            recall: stats.recall(),
            f1: stats.f1(),
        })
    }
}
