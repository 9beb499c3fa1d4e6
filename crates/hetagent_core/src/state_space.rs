//! Product state spaces.
//!
//! States are stored column-major with the asset dimension first, so a value
//! function of shape `(N_a, N_z)` stacks into a vector indexed by
//! `i_a + N_a * i_z`. All solvers use this layout.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSpace {
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl StateSpace {
    pub fn new(shape: Vec<usize>) -> Self {
        let mut strides = Vec::with_capacity(shape.len());
        let mut stride = 1;
        for &n in &shape {
            strides.push(stride);
            stride *= n;
        }
        Self { shape, strides }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stride(&self, dim: usize) -> usize {
        self.strides[dim]
    }

    pub fn linear_index(&self, sub: &[usize]) -> usize {
        debug_assert_eq!(sub.len(), self.shape.len());
        sub.iter().zip(&self.strides).map(|(i, s)| i * s).sum()
    }

    pub fn sub_indices(&self, index: usize) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.strides)
            .map(|(&n, &s)| (index / s) % n)
            .collect()
    }

    /// Index of dimension `dim` at linear position `index`.
    pub fn coordinate(&self, index: usize, dim: usize) -> usize {
        (index / self.strides[dim]) % self.shape[dim]
    }

    /// Moves `offset` steps along `dim`, holding every other coordinate fixed.
    /// Returns `None` when the move leaves the grid.
    pub fn neighbor(&self, index: usize, dim: usize, offset: isize) -> Option<usize> {
        let current = self.coordinate(index, dim) as isize;
        let target = current + offset;
        if target < 0 || target >= self.shape[dim] as isize {
            return None;
        }
        let shifted = index as isize + offset * self.strides[dim] as isize;
        Some(shifted as usize)
    }

    /// Linear indices of all states that share every coordinate with `index`
    /// except along `dim`, ordered along `dim`.
    pub fn slice(&self, index: usize, dim: usize) -> Vec<usize> {
        let base = index - self.coordinate(index, dim) * self.strides[dim];
        (0..self.shape[dim])
            .map(|k| base + k * self.strides[dim])
            .collect()
    }

    /// Ordering that visits dimensions in reverse, so the last dimension
    /// varies fastest. With a short income dimension this keeps asset
    /// neighbors close together, which the banded solver relies on.
    pub fn reversed_ordering(&self) -> Vec<usize> {
        let reversed = StateSpace::new(self.shape.iter().rev().cloned().collect());
        (0..self.len())
            .map(|k| {
                let mut sub = reversed.sub_indices(k);
                sub.reverse();
                self.linear_index(&sub)
            })
            .collect()
    }
}
