//! Core dense matrix type consumed by the autograd engine

use std::fmt::{self, Debug, Display};
use serde::{Serialize, Deserialize};

use crate::error::{KilnError, KilnResult};

/// Row-major two dimensional shape. Vectors are column vectors (`n x 1`),
/// scalars are `1 x 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn scalar() -> Self {
        Self { rows: 1, cols: 1 }
    }

    pub fn total_elements(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_scalar(&self) -> bool {
        self.rows == 1 && self.cols == 1
    }

    pub fn is_vector(&self) -> bool {
        self.cols == 1 || self.rows == 1
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}x{}]", self.rows, self.cols)
    }
}

/// Dense `f32` matrix with value semantics on read and explicit in-place mutators.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    shape: Shape,
    data: Vec<f32>,
}

impl Matrix {
    /// Create a matrix from row-major data
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> KilnResult<Self> {
        let shape = Shape::new(rows, cols);
        if data.len() != shape.total_elements() {
            return Err(KilnError::shape_error(
                &format!("{} elements for {}", shape.total_elements(), shape),
                &format!("{} elements", data.len()),
                None,
            ));
        }
        Ok(Self { shape, data })
    }

    /// Column vector
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: Shape::new(data.len(), 1),
            data,
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Shape::scalar(),
            data: vec![value],
        }
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: Shape) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: Shape, value: f32) -> Self {
        Self {
            shape,
            data: vec![value; shape.total_elements()],
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape)
    }

    pub fn ones_like(&self) -> Self {
        Self::ones(self.shape)
    }

    /// Wrap an existing buffer, reusing its allocation. The buffer is resized and zeroed.
    pub(crate) fn from_buffer(shape: Shape, mut buffer: Vec<f32>) -> Self {
        buffer.clear();
        buffer.resize(shape.total_elements(), 0.0);
        Self { shape, data: buffer }
    }

    /// Give the underlying buffer back, e.g. to a memory pool.
    pub(crate) fn into_buffer(self) -> Vec<f32> {
        self.data
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.rows
    }

    pub fn cols(&self) -> usize {
        self.shape.cols
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }

    pub fn same_shape(&self, other: &Matrix) -> bool {
        self.shape == other.shape
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn at(&self, row: usize, col: usize) -> KilnResult<f32> {
        if row >= self.shape.rows || col >= self.shape.cols {
            return Err(KilnError::InvalidInput(format!(
                "index ({}, {}) out of bounds for {}",
                row, col, self.shape
            )));
        }
        Ok(self.data[row * self.shape.cols + col])
    }

    /// The single element of a scalar matrix.
    pub fn scalar_value(&self) -> KilnResult<f32> {
        if !self.is_scalar() {
            return Err(KilnError::shape_error("a scalar", &self.shape.to_string(), None));
        }
        Ok(self.data[0])
    }
}

impl Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix")
            .field("shape", &self.shape)
            .field("data", &self.data)
            .finish()
    }
}
