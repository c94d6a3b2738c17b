//! The proposal pipeline: anchors, head inference, ranking, filtering and suppression.

use detection::anchor::AnchorGenerator;
use detection::bbox::{Bbox, Xyxy};
use detection::box_coder::BoxCoder;
use detection::nms::suppress;
use detection::ops::{clip, heights, to_bboxes, widths};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView2, ArrayView4, Axis};
use rand::Rng;

use crate::config::{Mode, RpnConfig};
use crate::head::{HeadOutput, ProposalHead, single_image};
use crate::loss::{RpnLosses, box_regression_loss, cross_entropy};
use crate::target::{Sample, TargetAssigner};
use crate::util::foreground_probability;
use crate::{Error, Result};

/// Everything a single forward pass produces.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalOutput {
    /// The full anchor set, in canonical order, with shape `(num_anchors, 4)`.
    pub anchors: Array2<f32>,
    /// Objectness logits of every anchor, with shape `(num_anchors, 2)`.
    pub objectness: Array2<f32>,
    /// Predicted transforms of every anchor, with shape `(num_anchors, 4)`.
    pub transforms: Array2<f32>,
    /// Proposals ranked by descending score, with shape `(num_proposals, 4)`.
    pub proposals: Array2<f32>,
    /// Foreground probability of every proposal.
    pub scores: Array1<f32>,
}

impl ProposalOutput {
    #[must_use]
    pub fn proposal_bboxes(&self) -> Vec<Bbox<Xyxy>> {
        to_bboxes(self.proposals.view())
    }
}

/// The predictions and targets the training losses are computed over.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingBatch {
    pub sample: Sample,
    /// Objectness logits of the sampled anchors, in batch order.
    pub objectness: Array2<f32>,
    /// Class index (0 background, 1 foreground) of the sampled anchors, in batch order.
    pub classes: Vec<usize>,
    /// Predicted transforms of the sampled foreground anchors.
    pub transform_predictions: Array2<f32>,
    /// Encoded ground-truth transforms of the sampled foreground anchors.
    pub transform_targets: Array2<f32>,
}

/// Region proposal network around a learned [`ProposalHead`].
///
/// The network itself is stateless across calls, the only long-lived state is the head's
/// parameters.
#[derive(Debug, Clone)]
pub struct ProposalNetwork<H> {
    head: H,
    anchor_generator: AnchorGenerator,
    box_coder: BoxCoder,
    assigner: TargetAssigner,
    config: RpnConfig,
}

impl<H: ProposalHead> ProposalNetwork<H> {
    pub fn new(head: H, config: RpnConfig) -> Result<Self> {
        config.validate()?;

        let anchor_generator = AnchorGenerator::new(
            config.anchor.base_size,
            config.anchor.scales.clone(),
            config.anchor.aspect_ratios.clone(),
        )?;

        if head.num_templates() != anchor_generator.num_templates() {
            return Err(Error::TemplateMismatch {
                head: head.num_templates(),
                anchors: anchor_generator.num_templates(),
            });
        }

        let box_coder = BoxCoder::new_with_clip(config.coder.weights, config.coder.bbox_xform_clip);
        let assigner = TargetAssigner::new(config.target);

        Ok(Self {
            head,
            anchor_generator,
            box_coder,
            assigner,
            config,
        })
    }

    #[must_use]
    pub fn head(&self) -> &H {
        &self.head
    }

    /// Mutable access to the head, for updating its parameters between calls.
    pub fn head_mut(&mut self) -> &mut H {
        &mut self.head
    }

    #[must_use]
    pub fn config(&self) -> &RpnConfig {
        &self.config
    }

    #[must_use]
    pub fn box_coder(&self) -> &BoxCoder {
        &self.box_coder
    }

    /// The anchor set of an image, in canonical order.
    pub fn anchors(&self, image_width: usize, image_height: usize) -> Result<Array2<f32>> {
        Ok(self
            .anchor_generator
            .generate(image_width, image_height, self.config.anchor.stride)?)
    }

    /// Run the full pipeline on a `(1, channels, height, width)` feature tensor.
    ///
    /// The feature grid must cover the image at the configured stride, that is
    /// `height == ceil(image_height / stride)` and `width == ceil(image_width / stride)`.
    pub fn forward(
        &self,
        features: ArrayView4<f32>,
        image_width: usize,
        image_height: usize,
        mode: Mode,
    ) -> Result<ProposalOutput> {
        let features = single_image(features)?;
        let (channels, grid_height, grid_width) = features.dim();
        if channels != self.head.in_channels() {
            return Err(Error::ChannelMismatch {
                expected: self.head.in_channels(),
                found: channels,
            });
        }

        let expected =
            AnchorGenerator::grid_size(image_width, image_height, self.config.anchor.stride)?;
        if expected != (grid_height, grid_width) {
            return Err(Error::GridMismatch {
                expected,
                found: (grid_height, grid_width),
            });
        }

        let anchors = self.anchors(image_width, image_height)?;

        let HeadOutput {
            objectness,
            transforms,
        } = self.head.predict(features)?;

        let (proposals, scores) = self.select_proposals(
            anchors.view(),
            objectness.view(),
            transforms.view(),
            image_width,
            image_height,
            mode,
        )?;

        Ok(ProposalOutput {
            anchors,
            objectness,
            transforms,
            proposals,
            scores,
        })
    }

    /// Turn per-anchor predictions into ranked, filtered, non-overlapping proposals.
    ///
    /// Anchors are ranked by their foreground logit margin, which orders them like the softmax
    /// probability but stays distinct where the probability rounds to `1.0`. Returns the
    /// proposals and their foreground probabilities, by descending probability.
    pub fn select_proposals(
        &self,
        anchors: ArrayView2<f32>,
        objectness: ArrayView2<f32>,
        transforms: ArrayView2<f32>,
        image_width: usize,
        image_height: usize,
        mode: Mode,
    ) -> Result<(Array2<f32>, Array1<f32>)> {
        for predictions in [objectness.nrows(), transforms.nrows()] {
            if predictions != anchors.nrows() {
                return Err(Error::AnchorMismatch {
                    anchors: anchors.nrows(),
                    predictions,
                });
            }
        }

        let config = &self.config.proposal;

        let margins = objectness
            .axis_iter(Axis(0))
            .map(|logits| logits[1] - logits[0])
            .collect_vec();
        let order = (0..margins.len())
            .sorted_by(|&a, &b| margins[b].total_cmp(&margins[a]))
            .collect_vec();

        let sorted_anchors = anchors.select(Axis(0), &order);
        let sorted_transforms = transforms.select(Axis(0), &order);

        let decoded = self
            .box_coder
            .decode(sorted_anchors.view(), sorted_transforms.view())?;
        let clipped = clip(
            decoded.view(),
            0.0,
            0.0,
            image_width as f32,
            image_height as f32,
        );

        let proposal_widths = widths(clipped.view());
        let proposal_heights = heights(clipped.view());
        let mut candidates = (0..clipped.nrows())
            .filter(|&i| {
                proposal_widths[i] >= config.min_size && proposal_heights[i] >= config.min_size
            })
            .collect_vec();
        let num_valid = candidates.len();
        candidates.truncate(config.pre_nms_top_n.get(mode));

        let candidate_boxes = clipped.select(Axis(0), &candidates);
        let mut keep = suppress(candidate_boxes.view(), config.nms_threshold);
        keep.truncate(config.post_nms_top_n.get(mode));

        tracing::debug!(
            ?mode,
            anchors = anchors.nrows(),
            valid = num_valid,
            pre_nms = candidates.len(),
            post_nms = keep.len(),
            "selected proposals"
        );
        if keep.is_empty() {
            tracing::warn!(image_width, image_height, "no proposals survived filtering");
        }

        let proposals = candidate_boxes.select(Axis(0), &keep);
        let proposal_scores = keep
            .iter()
            .map(|&i| {
                let logits = objectness.row(order[candidates[i]]);
                foreground_probability(logits[0], logits[1])
            })
            .collect::<Array1<f32>>();

        Ok((proposals, proposal_scores))
    }

    /// Label the anchors of a forward pass against `ground_truth`, and gather the predictions and
    /// targets of a balanced sample of them.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        output: &ProposalOutput,
        ground_truth: ArrayView2<f32>,
        image_width: usize,
        image_height: usize,
        rng: &mut R,
    ) -> Result<TrainingBatch> {
        let assignment = self.assigner.assign(
            output.anchors.view(),
            ground_truth,
            image_width,
            image_height,
        );
        let sample = self.assigner.sample(&assignment, rng);

        let objectness = output.objectness.select(Axis(0), &sample.indices);
        let classes = sample.labels.iter().filter_map(|l| l.class()).collect_vec();

        let transform_predictions = output.transforms.select(Axis(0), &sample.foreground);
        let foreground_anchors = output.anchors.select(Axis(0), &sample.foreground);
        let matched_ground_truth = ground_truth.select(Axis(0), &sample.foreground_targets);
        let transform_targets = self
            .box_coder
            .encode(foreground_anchors.view(), matched_ground_truth.view())?;

        tracing::debug!(
            inside = assignment.inside.len(),
            sampled = sample.len(),
            foreground = sample.num_foreground(),
            "sampled training batch"
        );

        Ok(TrainingBatch {
            sample,
            objectness,
            classes,
            transform_predictions,
            transform_targets,
        })
    }

    /// Classification and box regression losses of a sampled batch.
    ///
    /// An empty batch, or a batch without foreground anchors for the regression term, contributes
    /// a loss of `0.0`.
    #[must_use]
    pub fn loss(&self, batch: &TrainingBatch) -> RpnLosses {
        RpnLosses {
            classification: cross_entropy(batch.objectness.view(), &batch.classes),
            regression: box_regression_loss(
                batch.transform_predictions.view(),
                batch.transform_targets.view(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array4, array};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::config::HeadConfig;
    use crate::head::ConvHead;

    fn small_network(config: RpnConfig) -> ProposalNetwork<ConvHead> {
        let mut rng = StdRng::seed_from_u64(0);
        let head = ConvHead::new(&config.head, config.anchor.num_templates(), &mut rng);
        ProposalNetwork::new(head, config).unwrap()
    }

    fn small_config() -> RpnConfig {
        RpnConfig {
            head: HeadConfig {
                in_channels: 4,
                mid_channels: 4,
            },
            ..RpnConfig::default()
        }
    }

    fn logit(p: f32) -> f32 {
        (p / (1.0 - p)).ln()
    }

    /// A (score 0.9), B (0.8, IoU 0.75 with A), C (0.7, barely overlaps A) and a tiny D (0.99).
    fn scored_anchors() -> (Array2<f32>, Array2<f32>) {
        let anchors = array![
            [80.0, 0.0, 180.0, 100.0],
            [0.0, 0.0, 100.0, 100.0],
            [0.0, 0.0, 10.0, 10.0],
            [0.0, 0.0, 100.0, 75.0],
        ];
        let objectness = array![
            [0.0, logit(0.7)],
            [0.0, logit(0.9)],
            [0.0, logit(0.99)],
            [0.0, logit(0.8)],
        ];
        (anchors, objectness)
    }

    #[test]
    fn ranks_filters_and_suppresses() {
        let network = small_network(small_config());
        let (anchors, objectness) = scored_anchors();
        let transforms = Array2::zeros((4, 4));

        let (proposals, scores) = network
            .select_proposals(
                anchors.view(),
                objectness.view(),
                transforms.view(),
                200,
                200,
                Mode::Inference,
            )
            .unwrap();

        assert_eq!(
            proposals,
            array![[0.0, 0.0, 100.0, 100.0], [80.0, 0.0, 180.0, 100.0]]
        );
        assert!((scores[0] - 0.9).abs() < 1e-5);
        assert!((scores[1] - 0.7).abs() < 1e-5);
    }

    #[test]
    fn caps_depend_on_mode() {
        let mut config = small_config();
        config.proposal.post_nms_top_n.inference = 1;
        config.proposal.pre_nms_top_n.training = 1;
        let network = small_network(config);

        let (anchors, objectness) = scored_anchors();
        let transforms = Array2::zeros((4, 4));
        let run = |mode| {
            network
                .select_proposals(
                    anchors.view(),
                    objectness.view(),
                    transforms.view(),
                    200,
                    200,
                    mode,
                )
                .unwrap()
                .0
        };

        assert_eq!(run(Mode::Inference), array![[0.0, 0.0, 100.0, 100.0]]);
        assert_eq!(run(Mode::Training), array![[0.0, 0.0, 100.0, 100.0]]);
    }

    #[test]
    fn saturated_scores_keep_logit_order() {
        let network = small_network(small_config());
        // both probabilities round to 1.0 in f32, the second anchor is more confident
        let anchors = array![[0.0, 0.0, 100.0, 75.0], [0.0, 0.0, 100.0, 100.0]];
        let objectness = array![[0.0, 20.0], [0.0, 30.0]];

        let (proposals, scores) = network
            .select_proposals(
                anchors.view(),
                objectness.view(),
                Array2::zeros((2, 4)).view(),
                200,
                200,
                Mode::Inference,
            )
            .unwrap();

        assert_eq!(proposals, array![[0.0, 0.0, 100.0, 100.0]]);
        assert_eq!(scores.len(), 1);
    }

    #[test]
    fn proposals_are_clipped() {
        let network = small_network(small_config());
        let anchors = array![[-50.0, -50.0, 150.0, 60.0]];
        let objectness = array![[0.0, 1.0]];

        let (proposals, _) = network
            .select_proposals(
                anchors.view(),
                objectness.view(),
                Array2::zeros((1, 4)).view(),
                100,
                40,
                Mode::Inference,
            )
            .unwrap();

        assert_eq!(proposals, array![[0.0, 0.0, 100.0, 40.0]]);
    }

    #[test]
    fn degenerate_boxes_give_no_proposals() {
        let network = small_network(small_config());
        let anchors = array![[0.0, 0.0, 10.0, 10.0], [50.0, 50.0, 60.0, 90.0]];
        let objectness = Array2::zeros((2, 2));

        let (proposals, scores) = network
            .select_proposals(
                anchors.view(),
                objectness.view(),
                Array2::zeros((2, 4)).view(),
                100,
                100,
                Mode::Inference,
            )
            .unwrap();

        assert_eq!(proposals.dim(), (0, 4));
        assert!(scores.is_empty());
    }

    #[test]
    fn forward_end_to_end() {
        let network = small_network(small_config());
        let (width, height) = (64, 48);
        let features = Array4::from_shape_fn((1, 4, 3, 4), |(_, c, y, x)| {
            ((c * 7 + y * 3 + x) % 5) as f32 - 2.0
        });

        let output = network
            .forward(features.view(), width, height, Mode::Inference)
            .unwrap();

        assert_eq!(output.anchors.dim(), (3 * 4 * 9, 4));
        assert_eq!(output.objectness.dim(), (3 * 4 * 9, 2));
        assert_eq!(output.transforms.dim(), (3 * 4 * 9, 4));
        assert!(output.proposals.nrows() <= 300);
        assert_eq!(output.proposals.nrows(), output.scores.len());
        assert!(output.scores.windows(2).into_iter().all(|w| w[0] >= w[1]));

        for bbox in output.proposal_bboxes() {
            let (x1, y1, x2, y2) = bbox.inner;
            assert!(x1 >= 0.0 && y1 >= 0.0 && x2 <= width as f32 && y2 <= height as f32);
            assert!(bbox.width() >= 16.0 && bbox.height() >= 16.0);
        }
    }

    #[test]
    fn forward_rejects_mismatched_grid() {
        let network = small_network(small_config());
        let features = Array4::zeros((1, 4, 2, 2));

        assert!(matches!(
            network.forward(features.view(), 64, 48, Mode::Inference),
            Err(Error::GridMismatch {
                expected: (3, 4),
                found: (2, 2)
            })
        ));

        let features = Array4::zeros((1, 3, 3, 4));
        assert!(matches!(
            network.forward(features.view(), 64, 48, Mode::Inference),
            Err(Error::ChannelMismatch { .. })
        ));
    }

    #[test]
    fn rejects_predictions_for_other_anchors() {
        let network = small_network(small_config());

        assert!(matches!(
            network.select_proposals(
                Array2::zeros((3, 4)).view(),
                Array2::zeros((2, 2)).view(),
                Array2::zeros((3, 4)).view(),
                100,
                100,
                Mode::Inference,
            ),
            Err(Error::AnchorMismatch {
                anchors: 3,
                predictions: 2
            })
        ));
    }

    #[test]
    fn rejects_template_mismatch() {
        let config = small_config();
        let mut rng = StdRng::seed_from_u64(0);
        let head = ConvHead::new(&config.head, 3, &mut rng);

        assert!(matches!(
            ProposalNetwork::new(head, config),
            Err(Error::TemplateMismatch {
                head: 3,
                anchors: 9
            })
        ));
    }

    #[test]
    fn training_step() {
        let network = small_network(small_config());
        let (width, height) = (320, 320);
        let features = Array4::from_elem((1, 4, 20, 20), 0.5);
        let output = network
            .forward(features.view(), width, height, Mode::Training)
            .unwrap();

        let ground_truth = array![[40.0, 60.0, 200.0, 220.0], [150.0, 10.0, 310.0, 120.0]];
        let batch = network
            .sample(
                &output,
                ground_truth.view(),
                width,
                height,
                &mut StdRng::seed_from_u64(5),
            )
            .unwrap();

        assert!(batch.sample.len() <= 256);
        assert!(batch.sample.num_foreground() >= 2);
        assert!(batch.sample.num_foreground() <= 128);
        assert_eq!(batch.objectness.nrows(), batch.classes.len());
        assert_eq!(batch.transform_predictions.dim(), batch.transform_targets.dim());

        let losses = network.loss(&batch);
        assert!(losses.classification.is_finite() && losses.classification >= 0.0);
        assert!(losses.regression.is_finite() && losses.regression >= 0.0);

        let exact = TrainingBatch {
            transform_predictions: batch.transform_targets.clone(),
            ..batch
        };
        assert_eq!(network.loss(&exact).regression, 0.0);
    }

    #[test]
    fn training_step_without_ground_truth() {
        let network = small_network(small_config());
        let features = Array4::from_elem((1, 4, 20, 20), 0.1);
        let output = network
            .forward(features.view(), 320, 320, Mode::Training)
            .unwrap();

        let batch = network
            .sample(
                &output,
                Array2::zeros((0, 4)).view(),
                320,
                320,
                &mut StdRng::seed_from_u64(5),
            )
            .unwrap();

        assert!(batch.classes.iter().all(|&c| c == 0));
        assert_eq!(batch.transform_targets.nrows(), 0);
        assert_eq!(network.loss(&batch).regression, 0.0);
    }
}
