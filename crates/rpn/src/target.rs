//! Matching anchors against ground truth, and sampling a balanced training batch.

use detection::bbox::Bbox;
use detection::ops::{inside, iou};
use itertools::Itertools;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, seq::SliceRandom};

use crate::config::TargetConfig;

/// Training label of a single anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// Excluded from the loss.
    Ignore,
    Background,
    Foreground,
}

impl Label {
    /// The `{-1, 0, 1}` encoding of this label.
    #[must_use]
    pub const fn as_i8(self) -> i8 {
        match self {
            Label::Ignore => -1,
            Label::Background => 0,
            Label::Foreground => 1,
        }
    }

    /// Class index for the objectness logits, `None` for [`Label::Ignore`].
    #[must_use]
    pub const fn class(self) -> Option<usize> {
        match self {
            Label::Ignore => None,
            Label::Background => Some(0),
            Label::Foreground => Some(1),
        }
    }
}

/// Labels for the anchors that lie inside the image.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Indices into the full anchor set of the anchors that lie entirely inside the image.
    pub inside: Vec<usize>,
    /// Label of every inside anchor, parallel to [`Assignment::inside`].
    pub labels: Vec<Label>,
    /// Best matching ground-truth box of every inside anchor, `None` without ground truth.
    pub matched: Vec<Option<usize>>,
    /// IoU with the best matching ground-truth box, parallel to [`Assignment::inside`].
    pub max_ious: Vec<f32>,
}

impl Assignment {
    /// Indices into the full anchor set of the anchors with the given label.
    pub fn anchors_with(&self, label: Label) -> impl Iterator<Item = usize> + '_ {
        self.inside
            .iter()
            .zip(&self.labels)
            .filter(move |(_, l)| **l == label)
            .map(|(&anchor, _)| anchor)
    }
}

/// A balanced subset of labelled anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Indices into the full anchor set, in (shuffled) batch order.
    pub indices: Vec<usize>,
    /// Label of every sampled anchor, parallel to [`Sample::indices`].
    pub labels: Vec<Label>,
    /// Indices into the full anchor set of the sampled foreground anchors.
    pub foreground: Vec<usize>,
    /// Ground-truth box every sampled foreground anchor regresses to, parallel to
    /// [`Sample::foreground`].
    pub foreground_targets: Vec<usize>,
}

impl Sample {
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[must_use]
    pub fn num_foreground(&self) -> usize {
        self.foreground.len()
    }
}

/// Assigns training labels to anchors, and samples the batch the loss is computed over.
#[derive(Debug, Clone, Copy)]
pub struct TargetAssigner {
    config: TargetConfig,
}

impl TargetAssigner {
    #[must_use]
    pub fn new(config: TargetConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Label the anchors of an image against its ground-truth boxes.
    ///
    /// Anchors crossing the image boundary are excluded entirely. Of the others, those whose best
    /// IoU is below the background threshold are background, those at or above the foreground
    /// threshold are foreground, and so is every anchor tied for the highest IoU with some
    /// ground-truth box. A ground-truth box that overlaps no inside anchor forces the anchor whose
    /// center is closest to its own instead, and that anchor regresses toward it. Everything else
    /// is ignored.
    pub fn assign(
        &self,
        anchors: ArrayView2<f32>,
        ground_truth: ArrayView2<f32>,
        image_width: usize,
        image_height: usize,
    ) -> Assignment {
        let boundary = Bbox::xyxy(0.0, 0.0, image_width as f32, image_height as f32);
        let inside_indices = inside(anchors, &boundary)
            .iter()
            .positions(|&is_inside| is_inside)
            .collect_vec();

        let inside_anchors = anchors.select(Axis(0), &inside_indices);
        let ious = iou(inside_anchors.view(), ground_truth);

        let (mut matched, max_ious): (Vec<Option<usize>>, Vec<f32>) = ious
            .axis_iter(Axis(0))
            .map(|row| match row.iter().copied().position_max_by(f32::total_cmp) {
                Some(gt) => (Some(gt), row[gt]),
                None => (None, 0.0),
            })
            .unzip();

        let forced = forced_matches(inside_anchors.view(), ground_truth, &ious, &mut matched);

        let labels = max_ious
            .iter()
            .zip(&forced)
            .map(|(&max_iou, &is_forced)| {
                if is_forced || max_iou >= self.config.fg_iou_threshold {
                    Label::Foreground
                } else if max_iou < self.config.bg_iou_threshold {
                    Label::Background
                } else {
                    Label::Ignore
                }
            })
            .collect_vec();

        tracing::trace!(
            anchors = anchors.nrows(),
            inside = inside_indices.len(),
            ground_truth = ground_truth.nrows(),
            "assigned anchor labels"
        );

        Assignment {
            inside: inside_indices,
            labels,
            matched,
            max_ious,
        }
    }

    /// Sample a batch of at most `batch_size` anchors, of which at most `max_foreground` are
    /// foreground, and fill the remainder with background.
    ///
    /// Both pools are subsampled uniformly at random, and the final order is shuffled.
    pub fn sample<R: Rng + ?Sized>(&self, assignment: &Assignment, rng: &mut R) -> Sample {
        let mut foreground = (0..assignment.inside.len())
            .filter(|&i| assignment.labels[i] == Label::Foreground)
            .collect_vec();
        let mut background = (0..assignment.inside.len())
            .filter(|&i| assignment.labels[i] == Label::Background)
            .collect_vec();

        foreground.shuffle(rng);
        foreground.truncate(self.config.max_foreground);

        background.shuffle(rng);
        background.truncate(self.config.batch_size.saturating_sub(foreground.len()));

        let mut batch = foreground.iter().chain(&background).copied().collect_vec();
        batch.shuffle(rng);

        tracing::trace!(
            foreground = foreground.len(),
            background = background.len(),
            "sampled anchors"
        );

        Sample {
            indices: batch.iter().map(|&i| assignment.inside[i]).collect(),
            labels: batch.iter().map(|&i| assignment.labels[i]).collect(),
            foreground_targets: foreground
                .iter()
                .filter_map(|&i| assignment.matched[i])
                .collect(),
            foreground: foreground.iter().map(|&i| assignment.inside[i]).collect(),
        }
    }
}

/// Marks the anchors forced to foreground by being the best match of some ground-truth box.
///
/// A box without any overlap forces its nearest anchor by center distance, and takes over that
/// anchor's entry in `matched`.
fn forced_matches(
    anchors: ArrayView2<f32>,
    ground_truth: ArrayView2<f32>,
    ious: &Array2<f32>,
    matched: &mut [Option<usize>],
) -> Vec<bool> {
    let mut forced = vec![false; ious.nrows()];

    for (gt, column) in ious.axis_iter(Axis(1)).enumerate() {
        let best = column.iter().copied().fold(0.0_f32, f32::max);
        if best > 0.0 {
            for (anchor, &iou) in column.iter().enumerate() {
                if iou == best {
                    forced[anchor] = true;
                }
            }
        } else if let Some(anchor) = nearest_anchor(anchors, ground_truth.row(gt)) {
            forced[anchor] = true;
            matched[anchor] = Some(gt);
        }
    }

    forced
}

fn nearest_anchor(anchors: ArrayView2<f32>, target: ArrayView1<f32>) -> Option<usize> {
    let center = |b: ArrayView1<f32>| (0.5 * (b[0] + b[2]), 0.5 * (b[1] + b[3]));
    let (tx, ty) = center(target);

    anchors
        .axis_iter(Axis(0))
        .map(|anchor| {
            let (x, y) = center(anchor);
            (x - tx).powi(2) + (y - ty).powi(2)
        })
        .position_min_by(f32::total_cmp)
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn assigner() -> TargetAssigner {
        TargetAssigner::new(TargetConfig::default())
    }

    #[test]
    fn single_dominant_match() {
        let anchors = array![
            [0.0, 0.0, 10.0, 10.0],
            [7.0, 7.0, 93.0, 93.0],
            [80.0, 80.0, 100.0, 100.0],
            [-10.0, -10.0, 60.0, 60.0],
            [40.0, 0.0, 50.0, 10.0],
        ];
        let ground_truth = array![[5.0, 5.0, 95.0, 95.0]];

        let assignment = assigner().assign(anchors.view(), ground_truth.view(), 100, 100);

        assert_eq!(assignment.inside, vec![0, 1, 2, 4]);
        assert!(assignment.max_ious[1] > 0.9);
        assert_eq!(
            assignment.labels,
            vec![
                Label::Background,
                Label::Foreground,
                Label::Background,
                Label::Background
            ]
        );
        assert_eq!(assignment.matched, vec![Some(0); 4]);
    }

    #[test]
    fn best_anchor_is_forced_foreground() {
        // no anchor reaches the foreground threshold
        let anchors = array![[0.0, 0.0, 20.0, 20.0], [0.0, 0.0, 40.0, 40.0], [60.0, 60.0, 80.0, 80.0]];
        let ground_truth = array![[0.0, 0.0, 30.0, 30.0], [65.0, 65.0, 100.0, 100.0]];

        let assignment = assigner().assign(anchors.view(), ground_truth.view(), 100, 100);

        // iou(a0, g0) = 400/900, iou(a1, g0) = 900/1600, iou(a2, g1) = 225/1400
        assert_eq!(assignment.labels[0], Label::Ignore);
        assert_eq!(assignment.labels[1], Label::Foreground);
        assert_eq!(assignment.labels[2], Label::Foreground);
        assert_eq!(assignment.matched, vec![Some(0), Some(0), Some(1)]);
    }

    #[test]
    fn ties_are_all_forced() {
        let anchors = array![[0.0, 0.0, 20.0, 20.0], [20.0, 0.0, 40.0, 20.0]];
        let ground_truth = array![[10.0, 0.0, 30.0, 20.0]];

        let assignment = assigner().assign(anchors.view(), ground_truth.view(), 40, 20);

        assert_eq!(assignment.labels, vec![Label::Foreground; 2]);
    }

    #[test]
    fn ground_truth_without_overlap_forces_nearest_anchor() {
        let anchors = array![
            [20.0, 20.0, 40.0, 40.0],
            [50.0, 50.0, 90.0, 90.0],
            [10.0, 60.0, 30.0, 80.0],
        ];
        // the corner box overlaps no anchor
        let ground_truth = array![[0.0, 0.0, 5.0, 5.0], [50.0, 50.0, 90.0, 90.0]];

        let assignment = assigner().assign(anchors.view(), ground_truth.view(), 100, 100);

        assert_eq!(
            assignment.labels,
            vec![Label::Foreground, Label::Foreground, Label::Background]
        );
        assert_eq!(assignment.matched[0], Some(0));
        assert_eq!(assignment.matched[1], Some(1));
        assert_eq!(assignment.max_ious[0], 0.0);

        let sample = assigner().sample(&assignment, &mut StdRng::seed_from_u64(0));
        let corner = sample.foreground.iter().position(|&anchor| anchor == 0).unwrap();
        assert_eq!(sample.foreground_targets[corner], 0);
    }

    #[test]
    fn without_ground_truth_everything_is_background() {
        let anchors = array![[0.0, 0.0, 20.0, 20.0], [10.0, 10.0, 50.0, 50.0]];
        let ground_truth = Array2::<f32>::zeros((0, 4));

        let assignment = assigner().assign(anchors.view(), ground_truth.view(), 100, 100);

        assert_eq!(assignment.labels, vec![Label::Background; 2]);
        assert_eq!(assignment.matched, vec![None, None]);

        let sample = assigner().sample(&assignment, &mut StdRng::seed_from_u64(0));
        assert_eq!(sample.len(), 2);
        assert_eq!(sample.num_foreground(), 0);
        assert!(sample.foreground_targets.is_empty());
    }

    #[test]
    fn no_inside_anchors() {
        let anchors = array![[-10.0, -10.0, 20.0, 20.0]];
        let ground_truth = array![[0.0, 0.0, 10.0, 10.0]];

        let assignment = assigner().assign(anchors.view(), ground_truth.view(), 15, 15);
        assert!(assignment.inside.is_empty());

        let sample = assigner().sample(&assignment, &mut StdRng::seed_from_u64(0));
        assert!(sample.is_empty());
    }

    fn many_labels(foreground: usize, background: usize, ignored: usize) -> Assignment {
        let labels = std::iter::repeat_n(Label::Foreground, foreground)
            .chain(std::iter::repeat_n(Label::Background, background))
            .chain(std::iter::repeat_n(Label::Ignore, ignored))
            .collect_vec();
        let n = labels.len();

        Assignment {
            inside: (0..n).map(|i| i * 2).collect(),
            labels,
            matched: (0..n).map(|i| Some(i % 3)).collect(),
            max_ious: vec![0.0; n],
        }
    }

    #[test]
    fn sample_is_balanced() {
        let assignment = many_labels(500, 2000, 100);
        let sample = assigner().sample(&assignment, &mut StdRng::seed_from_u64(42));

        assert_eq!(sample.len(), 256);
        assert_eq!(sample.num_foreground(), 128);
        assert_eq!(sample.foreground_targets.len(), 128);
        assert_eq!(
            sample.labels.iter().filter(|l| **l == Label::Foreground).count(),
            128
        );
        assert!(sample.labels.iter().all(|l| *l != Label::Ignore));
        assert!(sample.indices.iter().all(|i| i % 2 == 0));
        assert_eq!(sample.indices.iter().unique().count(), 256);
    }

    #[test]
    fn background_fills_the_batch() {
        let assignment = many_labels(10, 2000, 0);
        let sample = assigner().sample(&assignment, &mut StdRng::seed_from_u64(1));

        assert_eq!(sample.len(), 256);
        assert_eq!(sample.num_foreground(), 10);

        let assignment = many_labels(10, 20, 0);
        let sample = assigner().sample(&assignment, &mut StdRng::seed_from_u64(1));
        assert_eq!(sample.len(), 30);
    }

    #[test]
    fn sampling_is_reproducible() {
        let assignment = many_labels(300, 3000, 0);

        let a = assigner().sample(&assignment, &mut StdRng::seed_from_u64(9));
        let b = assigner().sample(&assignment, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn foreground_targets_follow_matches() {
        let assignment = many_labels(5, 5, 0);
        let sample = assigner().sample(&assignment, &mut StdRng::seed_from_u64(3));

        for (&anchor, &target) in sample.foreground.iter().zip(&sample.foreground_targets) {
            assert_eq!(target, (anchor / 2) % 3);
        }
    }

    #[test]
    fn label_encoding() {
        assert_eq!(Label::Ignore.as_i8(), -1);
        assert_eq!(Label::Background.as_i8(), 0);
        assert_eq!(Label::Foreground.as_i8(), 1);
        assert_eq!(Label::Ignore.class(), None);
        assert_eq!(Label::Foreground.class(), Some(1));
    }
}
