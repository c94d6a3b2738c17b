use miette::{Context, Result};
use ndarray::{Array4, array};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rpn::prelude::*;
use tracing::info;

const WIDTH: usize = 800;
const HEIGHT: usize = 600;

fn main() -> Result<()> {
    miette::set_panic_hook();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => RpnConfig::load(&path).wrap_err_with(|| format!("Failed to load {path}"))?,
        None => RpnConfig::default(),
    };

    let mut rng = StdRng::seed_from_u64(0);
    let head = ConvHead::new(&config.head, config.anchor.num_templates(), &mut rng);
    let network = ProposalNetwork::new(head, config)?;

    let stride = network.config().anchor.stride;
    let channels = network.head().in_channels();
    let features = Array4::from_shape_simple_fn(
        (1, channels, HEIGHT.div_ceil(stride), WIDTH.div_ceil(stride)),
        || rng.random_range(0.0..1.0),
    );

    let output = network.forward(features.view(), WIDTH, HEIGHT, Mode::Inference)?;
    info!(
        anchors = output.anchors.nrows(),
        proposals = output.proposals.nrows(),
        "inference"
    );
    for (bbox, score) in output.proposal_bboxes().iter().zip(&output.scores).take(5) {
        info!(?bbox.inner, score, "proposal");
    }

    let ground_truth = array![[100.0, 120.0, 300.0, 400.0], [450.0, 200.0, 700.0, 330.0]];
    let output = network.forward(features.view(), WIDTH, HEIGHT, Mode::Training)?;
    let batch = network.sample(&output, ground_truth.view(), WIDTH, HEIGHT, &mut rng)?;
    let losses = network.loss(&batch);
    info!(
        sampled = batch.sample.len(),
        foreground = batch.sample.num_foreground(),
        classification = losses.classification,
        regression = losses.regression,
        "training step"
    );

    Ok(())
}
