//! Composable logical-to-physical index views.
//!
//! A `ShapeTracker` maps a logical multi-index to a `(physical_offset,
//! valid)` pair over a hypothetical contiguous buffer. It is a nonempty
//! stack of `View`s; most movement ops rewrite the outermost view in
//! place, and `reshape` pushes a fresh contiguous view when merging the
//! strides is impossible. Trackers are immutable value types: every op
//! returns a new tracker.
//!
//! The same tracker lowers two ways: numerically (`offset_and_valid`, used
//! for host readback and the kernel interpreter) and symbolically
//! (`to_alu_exp`, used to build fused kernel expressions). The two must
//! agree; the property tests in `tests.rs` check that.

#[cfg(test)]
mod tests;

use crate::alu::AluExp;
use crate::error::IrError;
use crate::shape::{apply_permutation, check_permutation, contiguous_strides, element_count};
use crate::IrResult;

/// One affine view: `(shape, strides, offset, mask?)`.
///
/// The mask, when present, gives the per-axis half-open range of valid
/// logical coordinates (used to encode padding).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
    shape: Vec<usize>,
    strides: Vec<isize>,
    offset: isize,
    mask: Option<Vec<(isize, isize)>>,
}

impl View {
    pub fn contiguous(shape: &[usize]) -> View {
        View {
            strides: contiguous_strides(shape),
            shape: shape.to_vec(),
            offset: 0,
            mask: None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn offset(&self) -> isize {
        self.offset
    }

    pub fn mask(&self) -> Option<&[(isize, isize)]> {
        self.mask.as_deref()
    }

    fn offset_at(&self, idx: &[i64]) -> i64 {
        let mut off = self.offset as i64;
        for (k, &i) in idx.iter().enumerate() {
            off += self.strides[k] as i64 * i;
        }
        off
    }

    fn valid_at(&self, idx: &[i64]) -> bool {
        match &self.mask {
            None => true,
            Some(mask) => idx
                .iter()
                .zip(mask)
                .all(|(&i, &(lo, hi))| i >= lo as i64 && i < hi as i64),
        }
    }

    /// Symbolic `(offset, valid)` of this single view at `indices`.
    fn to_alu(&self, indices: &[AluExp]) -> IrResult<(AluExp, AluExp)> {
        let mut off = AluExp::index(self.offset as i64);
        for (k, idx) in indices.iter().enumerate() {
            let term = AluExp::mul(idx.clone(), AluExp::index(self.strides[k] as i64))?;
            off = AluExp::add(off, term)?;
        }
        let mut valid = AluExp::bool_const(true);
        if let Some(mask) = &self.mask {
            for (k, idx) in indices.iter().enumerate() {
                let (lo, hi) = mask[k];
                // lo <= i  <=>  lo - 1 < i
                let ge = AluExp::cmplt(AluExp::index(lo as i64 - 1), idx.clone())?;
                let lt = AluExp::cmplt(idx.clone(), AluExp::index(hi as i64))?;
                valid = AluExp::and(valid, AluExp::and(ge, lt)?)?;
            }
        }
        Ok((off, valid))
    }
}

/// Stack of views; `views[0]` is adjacent to the physical buffer and the
/// last view carries the logical shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeTracker {
    views: Vec<View>,
}

impl ShapeTracker {
    /// Identity tracker over a contiguous buffer of `shape`.
    pub fn contiguous(shape: &[usize]) -> ShapeTracker {
        ShapeTracker {
            views: vec![View::contiguous(shape)],
        }
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn shape(&self) -> &[usize] {
        self.top().shape()
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Logical element count.
    pub fn size(&self) -> usize {
        element_count(self.shape())
    }

    fn top(&self) -> &View {
        self.views.last().expect("tracker views are nonempty")
    }

    fn with_top(&self, view: View) -> ShapeTracker {
        let mut views = self.views.clone();
        *views.last_mut().expect("tracker views are nonempty") = view;
        ShapeTracker { views }
    }

    /// True when a single identity view remains, i.e. logical order equals
    /// physical order with no mask.
    pub fn is_contiguous(&self) -> bool {
        self.views.len() == 1 && {
            let v = self.top();
            v.offset == 0
                && v.mask.is_none()
                && v.strides == contiguous_strides(&v.shape)
        }
    }

    // ---------- movement ops ----------

    /// Merge or split axes into `new_shape`; pushes a fresh view when the
    /// strides cannot express the regrouping.
    pub fn reshape(&self, new_shape: &[usize]) -> IrResult<ShapeTracker> {
        if new_shape == self.shape() {
            return Ok(self.clone());
        }
        if element_count(new_shape) != self.size() {
            return Err(IrError::Shape(format!(
                "cannot reshape {:?} ({} elements) to {:?} ({} elements)",
                self.shape(),
                self.size(),
                new_shape,
                element_count(new_shape)
            )));
        }
        let top = self.top();
        if top.mask.is_none() {
            if let Some(strides) = merge_strides(&top.shape, &top.strides, new_shape) {
                return Ok(self.with_top(View {
                    shape: new_shape.to_vec(),
                    strides,
                    offset: top.offset,
                    mask: None,
                }));
            }
        }
        let mut views = self.views.clone();
        views.push(View::contiguous(new_shape));
        Ok(ShapeTracker { views })
    }

    /// Permute axes: output axis `k` reads input axis `axes[k]`.
    pub fn permute(&self, axes: &[usize]) -> IrResult<ShapeTracker> {
        check_permutation(axes, self.ndim())?;
        let top = self.top();
        Ok(self.with_top(View {
            shape: apply_permutation(&top.shape, axes),
            strides: apply_permutation(&top.strides, axes),
            offset: top.offset,
            mask: top.mask.as_ref().map(|m| apply_permutation(m, axes)),
        }))
    }

    /// Insert unit axes at `added_axes` (positions in the output shape),
    /// then stretch every unit axis whose target dim differs, with stride 0.
    pub fn broadcast(&self, out_shape: &[usize], added_axes: &[usize]) -> IrResult<ShapeTracker> {
        if out_shape.len() != self.ndim() + added_axes.len() {
            return Err(IrError::Shape(format!(
                "broadcast of {:?} to {:?} adding axes {:?}",
                self.shape(),
                out_shape,
                added_axes
            )));
        }
        let top = self.top();
        let n_out = out_shape.len();
        let mut shape = Vec::with_capacity(n_out);
        let mut strides = Vec::with_capacity(n_out);
        let mut mask: Option<Vec<(isize, isize)>> = top.mask.as_ref().map(|_| Vec::new());
        let mut src_axis = 0usize;
        for out_axis in 0..n_out {
            if added_axes.contains(&out_axis) {
                shape.push(1);
                strides.push(0);
                if let Some(m) = mask.as_mut() {
                    m.push((0, 1));
                }
            } else {
                shape.push(top.shape[src_axis]);
                strides.push(top.strides[src_axis]);
                if let (Some(m), Some(old)) = (mask.as_mut(), top.mask.as_ref()) {
                    m.push(old[src_axis]);
                }
                src_axis += 1;
            }
        }
        // stretch unit dims
        for k in 0..n_out {
            if shape[k] == out_shape[k] {
                continue;
            }
            if shape[k] != 1 {
                return Err(IrError::Shape(format!(
                    "cannot broadcast axis {} of {:?} to {:?}",
                    k,
                    self.shape(),
                    out_shape
                )));
            }
            shape[k] = out_shape[k];
            strides[k] = 0;
            if let Some(m) = mask.as_mut() {
                // a valid unit axis is valid everywhere; an empty one stays empty
                m[k] = if m[k] == (0, 1) {
                    (0, out_shape[k] as isize)
                } else {
                    (0, 0)
                };
            }
        }
        Ok(self.with_top(View {
            shape,
            strides,
            offset: top.offset,
            mask,
        }))
    }

    /// Zero-pad each axis by `(before, after)` elements, encoded in the
    /// mask.
    pub fn pad(&self, widths: &[(usize, usize)]) -> IrResult<ShapeTracker> {
        if widths.len() != self.ndim() {
            return Err(IrError::Shape(format!(
                "pad widths {:?} against {}-d view",
                widths,
                self.ndim()
            )));
        }
        if widths.iter().all(|&(b, a)| b == 0 && a == 0) {
            return Ok(self.clone());
        }
        let top = self.top();
        let mut shape = Vec::with_capacity(self.ndim());
        let mut offset = top.offset;
        let mut mask = Vec::with_capacity(self.ndim());
        for (k, &(before, after)) in widths.iter().enumerate() {
            let d = top.shape[k];
            let (mlo, mhi) = top
                .mask
                .as_ref()
                .map(|m| m[k])
                .unwrap_or((0, d as isize));
            shape.push(d + before + after);
            offset -= before as isize * top.strides[k];
            mask.push((mlo + before as isize, mhi + before as isize));
        }
        Ok(self.with_top(View {
            shape,
            strides: top.strides.clone(),
            offset,
            mask: Some(mask),
        }))
    }

    /// Keep the half-open `ranges` of each axis.
    pub fn shrink(&self, ranges: &[(usize, usize)]) -> IrResult<ShapeTracker> {
        if ranges.len() != self.ndim() {
            return Err(IrError::Shape(format!(
                "shrink ranges {:?} against {}-d view",
                ranges,
                self.ndim()
            )));
        }
        let top = self.top();
        let mut shape = Vec::with_capacity(self.ndim());
        let mut offset = top.offset;
        let mut mask: Option<Vec<(isize, isize)>> = top.mask.as_ref().map(|_| Vec::new());
        let mut all_full = true;
        for (k, &(lo, hi)) in ranges.iter().enumerate() {
            if lo > hi || hi > top.shape[k] {
                return Err(IrError::Shape(format!(
                    "shrink range ({lo}, {hi}) out of bounds for axis of {}",
                    top.shape[k]
                )));
            }
            let d = hi - lo;
            shape.push(d);
            offset += lo as isize * top.strides[k];
            if let (Some(m), Some(old)) = (mask.as_mut(), top.mask.as_ref()) {
                let (mlo, mhi) = old[k];
                let lo = lo as isize;
                let nlo = (mlo - lo).max(0);
                let nhi = (mhi - lo).min(d as isize);
                if (nlo, nhi) != (0, d as isize) {
                    all_full = false;
                }
                m.push((nlo, nhi.max(nlo)));
            }
        }
        if all_full {
            mask = None;
        }
        Ok(self.with_top(View {
            shape,
            strides: top.strides.clone(),
            offset,
            mask,
        }))
    }

    /// Signed pad-or-shrink: a negative width shrinks that many elements,
    /// a positive width pads.
    pub fn pad_or_shrink(&self, ranges: &[(isize, isize)]) -> IrResult<ShapeTracker> {
        if ranges.len() != self.ndim() {
            return Err(IrError::Shape(format!(
                "pad_or_shrink ranges {:?} against {}-d view",
                ranges,
                self.ndim()
            )));
        }
        let shape = self.shape().to_vec();
        let shrink_ranges: Vec<(usize, usize)> = ranges
            .iter()
            .zip(&shape)
            .map(|(&(b, a), &d)| {
                let lo = (-b).max(0) as usize;
                let hi = d.saturating_sub((-a).max(0) as usize);
                (lo.min(hi), hi)
            })
            .collect();
        let pad_widths: Vec<(usize, usize)> = ranges
            .iter()
            .map(|&(b, a)| (b.max(0) as usize, a.max(0) as usize))
            .collect();
        self.shrink(&shrink_ranges)?.pad(&pad_widths)
    }

    /// Reverse the axes flagged in `axes`.
    pub fn flip(&self, axes: &[bool]) -> IrResult<ShapeTracker> {
        if axes.len() != self.ndim() {
            return Err(IrError::Shape(format!(
                "flip flags {:?} against {}-d view",
                axes,
                self.ndim()
            )));
        }
        let top = self.top();
        let mut strides = top.strides.clone();
        let mut offset = top.offset;
        let mut mask = top.mask.clone();
        for (k, &do_flip) in axes.iter().enumerate() {
            if !do_flip {
                continue;
            }
            let d = top.shape[k] as isize;
            offset += (d - 1) * strides[k];
            strides[k] = -strides[k];
            if let Some(m) = mask.as_mut() {
                let (lo, hi) = m[k];
                m[k] = (d - hi, d - lo);
            }
        }
        Ok(self.with_top(View {
            shape: top.shape.clone(),
            strides,
            offset,
            mask,
        }))
    }

    /// Tile each axis `counts[k]` times. Lowers to reshape + broadcast +
    /// reshape, so the index expression picks up the tiling modulo.
    pub fn repeat(&self, counts: &[usize]) -> IrResult<ShapeTracker> {
        if counts.len() != self.ndim() {
            return Err(IrError::Shape(format!(
                "repeat counts {:?} against {}-d view",
                counts,
                self.ndim()
            )));
        }
        let mut t = self.clone();
        for (axis, &c) in counts.iter().enumerate() {
            if c == 1 {
                continue;
            }
            let s = t.shape().to_vec();
            let mut with_unit = s.clone();
            with_unit.insert(axis, 1);
            let mut expanded = with_unit.clone();
            expanded[axis] = c;
            let mut merged = s.clone();
            merged[axis] = s[axis] * c;
            t = t
                .reshape(&with_unit)?
                .broadcast(&expanded, &[])?
                .reshape(&merged)?;
        }
        Ok(t)
    }

    /// Move axis `src` to position `dst`, keeping the rest in order.
    pub fn moveaxis(&self, src: usize, dst: usize) -> IrResult<ShapeTracker> {
        let n = self.ndim();
        if src >= n || dst >= n {
            return Err(IrError::Shape(format!(
                "moveaxis({src}, {dst}) on a {n}-d view"
            )));
        }
        let mut perm: Vec<usize> = (0..n).filter(|&k| k != src).collect();
        perm.insert(dst, src);
        self.permute(&perm)
    }

    /// Sequence two trackers: `self` reads the logical space of `inner`.
    /// The caller guarantees that `self` was built over a flat space of
    /// `inner.size()` elements; offsets out of that range are undefined.
    pub fn compose(&self, inner: &ShapeTracker) -> IrResult<ShapeTracker> {
        let mut views = inner.views.clone();
        views.extend(self.views.iter().cloned());
        Ok(ShapeTracker { views })
    }

    // ---------- lowering ----------

    /// Numeric `(physical_offset, valid)` of one logical index.
    pub fn offset_and_valid(&self, idx: &[i64]) -> (i64, bool) {
        let mut idx = idx.to_vec();
        for (k, view) in self.views.iter().enumerate().rev() {
            if !view.valid_at(&idx) {
                return (0, false);
            }
            let off = view.offset_at(&idx);
            if k == 0 {
                return (off, true);
            }
            idx = unravel(self.views[k - 1].shape(), off);
        }
        unreachable!("tracker views are nonempty")
    }

    /// Symbolic `(physical_offset, valid)` of a logical index vector. Pure
    /// in the tracker and the index expressions; constant folding through
    /// the `AluExp` constructors removes provably-true validity bits.
    pub fn to_alu_exp(&self, indices: &[AluExp]) -> IrResult<(AluExp, AluExp)> {
        if indices.len() != self.ndim() {
            return Err(IrError::Shape(format!(
                "{} indices into a {}-d view",
                indices.len(),
                self.ndim()
            )));
        }
        let mut idx = indices.to_vec();
        let mut valid = AluExp::bool_const(true);
        for (k, view) in self.views.iter().enumerate().rev() {
            let (off, v) = view.to_alu(&idx)?;
            valid = AluExp::and(valid, v)?;
            if k == 0 {
                return Ok((off, valid));
            }
            idx = unravel_alu(self.views[k - 1].shape(), off)?;
        }
        unreachable!("tracker views are nonempty")
    }
}

/// Split a flat row-major index into per-axis indices, numerically.
fn unravel(shape: &[usize], flat: i64) -> Vec<i64> {
    let strides = contiguous_strides(shape);
    shape
        .iter()
        .zip(&strides)
        .map(|(&d, &s)| {
            // a zero dim (or a stride zeroed by one) has no index space
            if d == 0 || s == 0 {
                0
            } else {
                flat.div_euclid(s as i64).rem_euclid(d as i64)
            }
        })
        .collect()
}

/// Split a flat row-major index expression into per-axis index
/// expressions with `Idiv`/`Mod`. Interval analysis drops the redundant
/// leading `Mod` when the flat index is already bounded.
pub fn unravel_alu(shape: &[usize], flat: AluExp) -> IrResult<Vec<AluExp>> {
    let strides = contiguous_strides(shape);
    shape
        .iter()
        .zip(&strides)
        .map(|(&d, &s)| {
            let q = AluExp::idiv(flat.clone(), AluExp::index(s as i64))?;
            AluExp::modulo(q, AluExp::index(d as i64))
        })
        .collect()
}

/// Try to express `new_shape` over the same data as `(shape, strides)`
/// without copying; returns the new strides on success. Standard
/// merge/split of contiguous runs.
fn merge_strides(shape: &[usize], strides: &[isize], new_shape: &[usize]) -> Option<Vec<isize>> {
    if shape.iter().any(|&d| d == 0) || new_shape.iter().any(|&d| d == 0) {
        return None;
    }
    // size-1 tensors reshape freely
    if element_count(shape) == 1 {
        return Some(vec![0; new_shape.len()]);
    }
    // strip unit axes from the old view; they carry no addressing
    let old: Vec<(usize, isize)> = shape
        .iter()
        .zip(strides)
        .filter(|&(&d, _)| d != 1)
        .map(|(&d, &s)| (d, s))
        .collect();
    let mut new_strides = vec![0isize; new_shape.len()];
    let keep: Vec<usize> = (0..new_shape.len()).filter(|&k| new_shape[k] != 1).collect();

    let (mut oi, mut ni) = (0usize, 0usize);
    while oi < old.len() && ni < keep.len() {
        let mut group_old = oi + 1;
        let mut group_new = ni + 1;
        let mut np = new_shape[keep[ni]];
        let mut op = old[oi].0;
        while np != op {
            if np < op {
                np *= new_shape[keep[group_new]];
                group_new += 1;
            } else {
                op *= old[group_old].0;
                group_old += 1;
            }
        }
        // the grouped old axes must be contiguous among themselves
        for k in oi..group_old - 1 {
            if old[k].1 != old[k + 1].1 * old[k + 1].0 as isize {
                return None;
            }
        }
        let mut stride = old[group_old - 1].1;
        for &k in keep[ni..group_new].iter().rev() {
            new_strides[k] = stride;
            stride *= new_shape[k] as isize;
        }
        oi = group_old;
        ni = group_new;
    }
    if oi != old.len() || ni != keep.len() {
        return None;
    }
    Some(new_strides)
}
