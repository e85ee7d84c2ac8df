use nalgebra::DVector;

/// A state that can move along the ellipse
/// `f cos θ + ν sin θ` through the current state `f` and a prior draw `ν`
pub trait EssParam: Clone {
    /// `a * self + b * other`
    fn linear_combine(&self, a: f64, other: &Self, b: f64) -> Self;
}

impl EssParam for DVector<f64> {
    fn linear_combine(&self, a: f64, other: &Self, b: f64) -> Self {
        self * a + other * b
    }
}

