use crate::{
    image::{ContainerConfig, Image, Layer},
    steps::runtime::{Step, StepPool},
};

/// Assemble the in-memory image the manifest is derived from. Pure and
/// deterministic: base layers stack below application layers, and the
/// creation timestamp is whatever the configuration says.
pub(crate) fn build_image(
    pool: &StepPool,
    base: Vec<Layer>,
    application: Vec<Layer>,
    config: ContainerConfig,
) -> Step<Image> {
    Step::compose(pool, async move {
        let mut layers = base;
        layers.extend(application);

        Ok(Image { layers, config })
    })
}
