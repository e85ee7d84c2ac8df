pub mod linear;
pub mod radial;
pub mod subspace;
pub mod whitening;

pub use linear::LinearTransform;
pub use radial::RadialGaussianization;
pub use subspace::SubspaceGaussianization;
pub use whitening::{WhiteningKind, WhiteningTransform};

use crate::traits::Transform;
use crate::{DVec, Mat};
use serde::{Deserialize, Serialize};

/// Any of the transforms of this crate, so that chains of them can be
/// stored and reloaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AnyTransform {
    Linear(LinearTransform),
    Whitening(WhiteningTransform),
    Radial(RadialGaussianization),
    Subspace(SubspaceGaussianization),
}

impl AnyTransform {
    fn inner(&self) -> &dyn Transform {
        match self {
            AnyTransform::Linear(t) => t,
            AnyTransform::Whitening(t) => t,
            AnyTransform::Radial(t) => t,
            AnyTransform::Subspace(t) => t,
        }
    }
}

impl Transform for AnyTransform {
    fn apply(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.inner().apply(data)
    }

    fn inverse(&self, data: &Mat) -> anyhow::Result<Mat> {
        self.inner().inverse(data)
    }

    fn logjacobian(&self, data: &Mat) -> anyhow::Result<DVec> {
        self.inner().logjacobian(data)
    }
}

impl From<LinearTransform> for AnyTransform {
    fn from(t: LinearTransform) -> Self {
        AnyTransform::Linear(t)
    }
}

impl From<WhiteningTransform> for AnyTransform {
    fn from(t: WhiteningTransform) -> Self {
        AnyTransform::Whitening(t)
    }
}

impl From<RadialGaussianization> for AnyTransform {
    fn from(t: RadialGaussianization) -> Self {
        AnyTransform::Radial(t)
    }
}

impl From<SubspaceGaussianization> for AnyTransform {
    fn from(t: SubspaceGaussianization) -> Self {
        AnyTransform::Subspace(t)
    }
}
