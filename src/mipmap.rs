// SPDX-License-Identifier: LGPL-3.0-or-later OR MPL-2.0
// This file is a part of `tessera`.
//
// `tessera` is free software: you can redistribute it and/or modify it under the terms of
// either:
//
// * GNU Lesser General Public License as published by the Free Software Foundation, either
// version 3 of the License, or (at your option) any later version.
// * Mozilla Public License as published by the Mozilla Foundation, version 2.
//
// `tessera` is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Lesser General Public License or the Mozilla Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License and the Mozilla
// Public License along with `tessera`. If not, see <https://www.gnu.org/licenses/> or
// <https://www.mozilla.org/en-US/MPL/2.0/>.

//! Mipmap sets: the original image plus lazily rendered scaled levels.

use crate::gpu_backend::{Address, CompositeMode, Filter, GpuContext, QUAD_INDICES};
use crate::shareable;
use crate::{Region, MAX_IMAGE_SIZE};

use ahash::RandomState;
use hashbrown::HashMap;
use kurbo::Affine;

/// The level clamp: positive levels are downsamples, negative levels are
/// upsamples rendered ahead of magnification.
pub(crate) const MAX_MIPMAP_LEVEL: i32 = 6;

type LevelKey = (i32, i32, i32, i32, i32);

fn level_key(r: Region, level: i32) -> LevelKey {
    (r.min.x, r.min.y, r.max.x, r.max.y, level)
}

/// The original-level image plus a sparse map of scaled levels, keyed by the
/// source bounds they were rendered from.
pub(crate) struct Mipmap<C: GpuContext + ?Sized> {
    orig: shareable::Image<C>,
    imgs: HashMap<LevelKey, shareable::Image<C>, RandomState>,
}

impl<C: GpuContext + ?Sized> Mipmap<C> {
    pub(crate) fn new(orig: shareable::Image<C>) -> Self {
        Mipmap {
            orig,
            imgs: HashMap::with_hasher(RandomState::new()),
        }
    }

    pub(crate) fn original(&self) -> &shareable::Image<C> {
        &self.orig
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.orig.is_disposed()
    }

    /// The mipmap image of `bounds` at `level`, rendered on demand by scaled
    /// draws from the nearest existing level. `None` when a dimension
    /// vanishes (or explodes) at that level.
    pub(crate) fn level(&mut self, bounds: Region, level: i32) -> Option<&shareable::Image<C>> {
        assert!(level != 0, "mipmap: level 0 is the original image");
        let step = if level > 0 { 1 } else { -1 };
        let mut l = step;
        loop {
            if !self.imgs.contains_key(&level_key(bounds, l)) {
                let (src_w, src_h, from_orig) = if l == step {
                    (bounds.width(), bounds.height(), true)
                } else {
                    let prev = &self.imgs[&level_key(bounds, l - step)];
                    let (w, h) = prev.size();
                    (w, h, false)
                };
                let (w, h, scale) = if step > 0 {
                    (src_w / 2, src_h / 2, 0.5f32)
                } else {
                    (src_w * 2, src_h * 2, 2.0f32)
                };
                if w <= 0 || h <= 0 || w > MAX_IMAGE_SIZE || h > MAX_IMAGE_SIZE {
                    return None;
                }
                let geo = [scale, 0.0, 0.0, scale, 0.0, 0.0];
                let img = shareable::Image::new(self.orig.atlases(), w, h);
                if from_orig {
                    let vs = self.orig.quad_vertices(
                        bounds.min.x,
                        bounds.min.y,
                        bounds.max.x,
                        bounds.max.y,
                        geo,
                        [1.0; 4],
                    );
                    img.draw_triangles(
                        &self.orig,
                        vs,
                        QUAD_INDICES.to_vec(),
                        None,
                        CompositeMode::Copy,
                        Filter::Linear,
                        Address::ClampToZero,
                    );
                } else {
                    let prev = &self.imgs[&level_key(bounds, l - step)];
                    let vs = prev.quad_vertices(0, 0, src_w, src_h, geo, [1.0; 4]);
                    img.draw_triangles(
                        prev,
                        vs,
                        QUAD_INDICES.to_vec(),
                        None,
                        CompositeMode::Copy,
                        Filter::Linear,
                        Address::ClampToZero,
                    );
                }
                self.imgs.insert(level_key(bounds, l), img);
            }
            if l == level {
                break;
            }
            l += step;
        }
        self.imgs.get(&level_key(bounds, level))
    }

    /// Release every level above the original. Called after any modification
    /// of the level-0 image, whose levels are then out of date.
    pub(crate) fn dispose_mipmaps(&mut self) {
        self.imgs.clear();
    }

    pub(crate) fn dispose(&mut self) {
        self.imgs.clear();
        self.orig.dispose();
    }
}

/// The mipmap level a draw with this geometry should sample from:
/// `floor(log2(1 / scale))`, 0 when the filter bypasses mipmaps.
///
/// The caller clamps to `[-MAX_MIPMAP_LEVEL, MAX_MIPMAP_LEVEL]` after
/// demoting levels that would collapse a dimension.
pub(crate) fn mipmap_level(transform: &Affine, filter: Filter) -> i32 {
    if filter != Filter::Linear {
        return 0;
    }
    let [a, b, c, d, _, _] = transform.as_coeffs();
    let sx = a.hypot(b);
    let sy = c.hypot(d);
    let scale = sx.max(sy);
    if !(scale.is_finite() && scale > 0.0) {
        return 0;
    }
    (1.0 / scale).log2().floor() as i32
}
