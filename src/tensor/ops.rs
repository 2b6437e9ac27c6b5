//! Element-wise algebra on `Matrix`

use crate::error::{KilnError, KilnResult};
use super::core::Matrix;

impl Matrix {
    fn check_same_shape(&self, other: &Matrix, operation: &str) -> KilnResult<()> {
        if !self.same_shape(other) {
            return Err(KilnError::shape_error(
                &self.shape().to_string(),
                &other.shape().to_string(),
                Some(&format!("operands of {} must have the same shape", operation)),
            ));
        }
        Ok(())
    }

    /// `self += other`
    pub fn add_in_place(&mut self, other: &Matrix) -> KilnResult<()> {
        self.check_same_shape(other, "add_in_place")?;
        for (a, b) in self.as_slice_mut().iter_mut().zip(other.as_slice()) {
            *a += *b;
        }
        Ok(())
    }

    pub fn add(&self, other: &Matrix) -> KilnResult<Matrix> {
        let mut out = self.clone();
        out.add_in_place(other)?;
        Ok(out)
    }

    pub fn sub(&self, other: &Matrix) -> KilnResult<Matrix> {
        self.check_same_shape(other, "sub")?;
        Ok(self.zip_map(other, |a, b| a - b))
    }

    /// Element-wise (Hadamard) product
    pub fn prod(&self, other: &Matrix) -> KilnResult<Matrix> {
        self.check_same_shape(other, "prod")?;
        Ok(self.zip_map(other, |a, b| a * b))
    }

    pub fn prod_scalar(&self, k: f32) -> Matrix {
        self.map(|x| x * k)
    }

    pub fn add_scalar(&self, k: f32) -> Matrix {
        self.map(|x| x + k)
    }

    pub fn neg(&self) -> Matrix {
        self.map(|x| -x)
    }

    pub fn sum(&self) -> f32 {
        self.as_slice().iter().sum()
    }

    pub fn map<F>(&self, f: F) -> Matrix
    where
        F: Fn(f32) -> f32,
    {
        let mut out = self.clone();
        for x in out.as_slice_mut() {
            *x = f(*x);
        }
        out
    }

    fn zip_map<F>(&self, other: &Matrix, f: F) -> Matrix
    where
        F: Fn(f32, f32) -> f32,
    {
        let mut out = self.clone();
        for (a, b) in out.as_slice_mut().iter_mut().zip(other.as_slice()) {
            *a = f(*a, *b);
        }
        out
    }

    /// Element-wise approximate equality, used by tests and gradient checks.
    pub fn approx_eq(&self, other: &Matrix, tolerance: f32) -> bool {
        self.same_shape(other)
            && self
                .as_slice()
                .iter()
                .zip(other.as_slice())
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}
