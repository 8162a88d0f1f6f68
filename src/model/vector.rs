use crate::binio;
use crate::config::Representation;
use crate::error::{Error, Result};
use crate::{Index, IndexValueVec, Weight};
use hashbrown::HashMap;
use ndarray::Array1;
use sprs::CsVecI;
use std::io::{Read, Write};
use std::mem::size_of;

type DenseVec = Array1<Weight>;
type SparseVec = CsVecI<Weight, Index>;

const DENSE_TAG: i32 = 0;
const SPARSE_TAG: i32 = 1;
const MAP_TAG: i32 = 2;

/// A feature-indexed weight vector, can be dense, sparse or map-backed.
///
/// All layouts expose the same operations; a vector can be converted between
/// layouts, and the layout chosen at load time is driven by the memory
/// estimates below.
#[derive(Clone, Debug)]
pub enum Weights {
    Dense(DenseVec),
    Sparse(SparseVec),
    Map { dim: usize, entries: HashMap<Index, Weight> },
}

impl Weights {
    pub fn new_dense(dim: usize) -> Self {
        Weights::Dense(DenseVec::zeros(dim))
    }

    pub fn new_map(dim: usize) -> Self {
        Weights::Map {
            dim,
            entries: HashMap::new(),
        }
    }

    /// Number of feature columns the vector spans.
    pub fn size(&self) -> usize {
        match self {
            Weights::Dense(w) => w.len(),
            Weights::Sparse(w) => w.dim(),
            Weights::Map { dim, .. } => *dim,
        }
    }

    pub fn non_zero(&self) -> usize {
        match self {
            Weights::Dense(w) => w.iter().filter(|&&v| v != 0.0).count(),
            Weights::Sparse(w) => w.nnz(),
            Weights::Map { entries, .. } => entries.values().filter(|&&v| v != 0.0).count(),
        }
    }

    /// Dot product against a sparse feature row; ids absent from the vector
    /// contribute zero.
    ///
    ///     # use labeltree::model::vector::Weights;
    ///     let mut w = Weights::new_dense(6);
    ///     w.update(1, 0.5);
    ///     w.update(4, 2.0);
    ///     assert_eq!(0.5 * 1.0 + 2.0 * 3.0, w.dot(&[(1, 1.0), (4, 3.0), (5, 7.0)]));
    ///
    pub fn dot(&self, features: &[(Index, Weight)]) -> Weight {
        match self {
            Weights::Dense(w) => features
                .iter()
                .map(|&(i, v)| w.get(i as usize).copied().unwrap_or(0.0) * v)
                .sum(),
            Weights::Sparse(w) => {
                let indices = w.indices();
                let data = w.data();
                let mut sum = 0.0;
                let mut s = 0;
                for &(i, v) in features {
                    while s < indices.len() && indices[s] < i {
                        s += 1;
                    }
                    if s == indices.len() {
                        break;
                    }
                    if indices[s] == i {
                        sum += data[s] * v;
                    }
                }
                sum
            }
            Weights::Map { entries, .. } => features
                .iter()
                .map(|&(i, v)| entries.get(&i).copied().unwrap_or(0.0) * v)
                .sum(),
        }
    }

    /// Add `delta` to the weight at `index`, inserting the entry if absent.
    pub fn update(&mut self, index: Index, delta: Weight) {
        match self {
            Weights::Dense(w) => w[index as usize] += delta,
            Weights::Sparse(w) => {
                let dim = w.dim();
                let mut indices = w.indices().to_vec();
                let mut data = w.data().to_vec();
                match indices.binary_search(&index) {
                    Ok(pos) => data[pos] += delta,
                    Err(pos) => {
                        indices.insert(pos, index);
                        data.insert(pos, delta);
                    }
                }
                *w = SparseVec::new(dim, indices, data);
            }
            Weights::Map { entries, .. } => *entries.entry(index).or_insert(0.0) += delta,
        }
    }

    /// Weight at `index`, zero when absent.
    pub fn get(&self, index: Index) -> Weight {
        match self {
            Weights::Dense(w) => w.get(index as usize).copied().unwrap_or(0.0),
            Weights::Sparse(w) => match w.indices().binary_search(&index) {
                Ok(pos) => w.data()[pos],
                Err(_) => 0.0,
            },
            Weights::Map { entries, .. } => entries.get(&index).copied().unwrap_or(0.0),
        }
    }

    pub fn set(&mut self, index: Index, value: Weight) {
        let old = self.get(index);
        self.update(index, value - old);
    }

    /// Negate every weight in place.
    pub fn invert(&mut self) {
        match self {
            Weights::Dense(w) => w.mapv_inplace(|v| -v),
            Weights::Sparse(w) => {
                let dim = w.dim();
                let indices = w.indices().to_vec();
                let data = w.data().iter().map(|&v| -v).collect();
                *w = SparseVec::new(dim, indices, data);
            }
            Weights::Map { entries, .. } => {
                for v in entries.values_mut() {
                    *v = -*v;
                }
            }
        }
    }

    /// Drop every entry with |value| <= threshold. Callers that must keep the
    /// bias restore it afterwards.
    pub fn prune(&mut self, threshold: Weight) {
        match self {
            Weights::Dense(w) => w.mapv_inplace(|v| if v.abs() <= threshold { 0.0 } else { v }),
            Weights::Sparse(w) => {
                let dim = w.dim();
                let (indices, data) = w
                    .indices()
                    .iter()
                    .zip(w.data())
                    .filter(|&(_, v)| v.abs() > threshold)
                    .map(|(&i, &v)| (i, v))
                    .unzip();
                *w = SparseVec::new(dim, indices, data);
            }
            Weights::Map { entries, .. } => entries.retain(|_, v| v.abs() > threshold),
        }
    }

    /// Non-zero entries as sorted (id, value) pairs.
    pub fn to_pairs(&self) -> IndexValueVec {
        match self {
            Weights::Dense(w) => w
                .iter()
                .enumerate()
                .filter(|&(_, &v)| v != 0.0)
                .map(|(i, &v)| (i as Index, v))
                .collect(),
            Weights::Sparse(w) => w
                .indices()
                .iter()
                .zip(w.data())
                .map(|(&i, &v)| (i, v))
                .collect(),
            Weights::Map { entries, .. } => {
                let mut pairs: IndexValueVec =
                    entries.iter().map(|(&i, &v)| (i, v)).filter(|&(_, v)| v != 0.0).collect();
                pairs.sort_unstable_by_key(|&(i, _)| i);
                pairs
            }
        }
    }

    fn from_pairs(dim: usize, pairs: IndexValueVec, representation: Representation) -> Self {
        match representation {
            Representation::Dense => {
                let mut w = DenseVec::zeros(dim);
                for (i, v) in pairs {
                    w[i as usize] = v;
                }
                Weights::Dense(w)
            }
            Representation::Sparse => {
                let (indices, data) = pairs.into_iter().unzip();
                Weights::Sparse(SparseVec::new(dim, indices, data))
            }
            Representation::Map => Weights::Map {
                dim,
                entries: pairs.into_iter().collect(),
            },
        }
    }

    pub fn representation(&self) -> Representation {
        match self {
            Weights::Dense(_) => Representation::Dense,
            Weights::Sparse(_) => Representation::Sparse,
            Weights::Map { .. } => Representation::Map,
        }
    }

    /// Convert to the given layout, rebuilding through the non-zero pairs.
    pub fn into_representation(self, representation: Representation) -> Self {
        if self.representation() == representation {
            return self;
        }
        let dim = self.size();
        Weights::from_pairs(dim, self.to_pairs(), representation)
    }

    /// Predicted byte cost of holding a vector of `size` columns with
    /// `non_zero` entries in the given layout.
    pub fn estimate_mem(representation: Representation, size: usize, non_zero: usize) -> usize {
        const ENTRY: usize = size_of::<Index>() + size_of::<Weight>();
        match representation {
            Representation::Dense => size * size_of::<Weight>(),
            Representation::Sparse => non_zero * ENTRY,
            // hashbrown stores a control byte per slot and keeps load factor
            // below 7/8, plus padding to the pair alignment
            Representation::Map => non_zero * (size_of::<(Index, Weight)>() + 2) * 8 / 7,
        }
    }

    /// Actual byte cost of the current layout.
    pub fn mem(&self) -> usize {
        Self::estimate_mem(self.representation(), self.size(), self.non_zero())
    }

    /// Write the vector in its native layout, prefixed by a layout tag.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        match self {
            Weights::Dense(w) => {
                binio::write_i32(out, DENSE_TAG)?;
                binio::write_u64(out, w.len() as u64)?;
                for &v in w {
                    binio::write_f64(out, v)?;
                }
            }
            Weights::Sparse(_) => {
                binio::write_i32(out, SPARSE_TAG)?;
                self.save_pairs(out)?;
            }
            Weights::Map { .. } => {
                binio::write_i32(out, MAP_TAG)?;
                self.save_pairs(out)?;
            }
        }
        Ok(())
    }

    fn save_pairs<W: Write>(&self, out: &mut W) -> Result<()> {
        let pairs = self.to_pairs();
        binio::write_u64(out, self.size() as u64)?;
        binio::write_u64(out, pairs.len() as u64)?;
        for (i, v) in pairs {
            binio::write_i32(out, i as i32)?;
            binio::write_f64(out, v)?;
        }
        Ok(())
    }

    /// Read a vector back in the layout it was written in; callers convert
    /// afterwards if another layout suits them better.
    pub fn load<R: Read>(input: &mut R) -> Result<Self> {
        let tag = binio::read_i32(input)?;
        match tag {
            DENSE_TAG => {
                let len = binio::read_u64(input)? as usize;
                let mut w = DenseVec::zeros(len);
                for i in 0..len {
                    w[i] = binio::read_f64(input)?;
                }
                Ok(Weights::Dense(w))
            }
            SPARSE_TAG | MAP_TAG => {
                let (dim, pairs) = Self::load_pairs(input)?;
                let representation = if tag == SPARSE_TAG {
                    Representation::Sparse
                } else {
                    Representation::Map
                };
                Ok(Weights::from_pairs(dim, pairs, representation))
            }
            _ => Err(Error::Model(format!("unknown weight layout tag: {}", tag))),
        }
    }

    fn load_pairs<R: Read>(input: &mut R) -> Result<(usize, IndexValueVec)> {
        let dim = binio::read_u64(input)? as usize;
        let count = binio::read_u64(input)? as usize;
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let i = binio::read_i32(input)?;
            let v = binio::read_f64(input)?;
            pairs.push((i as Index, v));
        }
        Ok((dim, pairs))
    }
}
