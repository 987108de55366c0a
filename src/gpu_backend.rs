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

//! Defines the GPU driver backend consumed by the image management core.

use crate::color::ColorM;
use crate::Region;

use std::error::Error;
use std::rc::Rc;

/// The driver backend for the image management core.
///
/// Implementations own texture creation, pixel upload/readback and triangle
/// submission. Commands may be batched internally; readbacks are expected to
/// flush any pending commands before returning.
pub trait GpuContext {
    /// The type associated with a GPU texture.
    type Texture;

    /// The error type associated with this GPU context.
    type Error: Error + 'static;

    /// Create a new texture of the given size, with transparent contents.
    fn new_texture(&self, width: i32, height: i32) -> Result<Self::Texture, Self::Error>;

    /// Create the texture backing the screen framebuffer.
    ///
    /// The returned texture may have no pixel storage of its own; it is never
    /// read back and its contents are transient.
    fn new_screen_framebuffer_texture(
        &self,
        width: i32,
        height: i32,
    ) -> Result<Self::Texture, Self::Error>;

    /// Replace the pixels of a region of a texture.
    ///
    /// `pixels` holds premultiplied RGBA bytes, four per pixel, row-major
    /// over the region. `None` clears the region to transparent.
    fn replace_pixels(&self, texture: &Self::Texture, pixels: Option<&[u8]>, region: Region);

    /// Draw a triangle list from `source` onto `target`.
    ///
    /// Vertices use the 12-float layout described by [`VERTEX_FLOAT_COUNT`].
    /// The vertex color scale multiplies the premultiplied source texel, with
    /// the alpha component scaling all four channels. A color matrix, when
    /// present, is applied to straight-alpha colors before the vertex scale.
    #[allow(clippy::too_many_arguments)]
    fn draw_triangles(
        &self,
        target: &Self::Texture,
        source: &Self::Texture,
        vertices: &[f32],
        indices: &[u16],
        color_matrix: Option<&ColorM>,
        mode: CompositeMode,
        filter: Filter,
        address: Address,
    );

    /// Read the full contents of a texture as premultiplied RGBA bytes.
    fn pixels(&self, texture: &Self::Texture) -> Result<Vec<u8>, Self::Error>;

    /// Delete a texture.
    fn delete_texture(&self, texture: Self::Texture);

    /// Whether the texture has been invalidated by a device loss.
    fn is_invalidated(&self, texture: &Self::Texture) -> bool;

    /// Flush any batched commands.
    fn flush(&self);

    /// Get the maximum texture size.
    fn max_texture_size(&self) -> i32;

    /// Whether the driver supports high-precision floats in shaders.
    fn has_high_precision_float(&self) -> bool;

    /// Whether textures can be lost and need restoring on this driver.
    fn needs_restoring(&self) -> bool;

    /// Reset the driver state after a device loss.
    fn reset_state(&self) -> Result<(), Self::Error>;
}

/// The composite (blend) mode for a draw.
///
/// These are the Porter-Duff operators over premultiplied colors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CompositeMode {
    /// Regular alpha blending: `dst = src + dst * (1 - src.alpha)`.
    #[default]
    SourceOver,
    Clear,
    Copy,
    Destination,
    DestinationOver,
    SourceIn,
    DestinationIn,
    SourceOut,
    DestinationOut,
    SourceAtop,
    DestinationAtop,
    Xor,
    /// Additive blending: `dst = src + dst`.
    Lighter,
}

/// A texture filter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Filter {
    /// Use the filter specified at image creation. Resolved to [`Filter::Nearest`]
    /// before a draw reaches the driver.
    #[default]
    Default,
    Nearest,
    Linear,
}

/// A sampler address mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Address {
    /// Out-of-bounds source coordinates sample transparent black.
    #[default]
    ClampToZero,
    /// Source coordinates wrap to the other side of the source region.
    Repeat,
}

/// The number of floats per vertex in the driver layout:
/// `dst_x, dst_y, src_x, src_y, bounds_min_x, bounds_min_y, bounds_max_x,
/// bounds_max_y, color_r, color_g, color_b, color_a`.
pub const VERTEX_FLOAT_COUNT: usize = 12;

/// The maximum number of indices accepted by a single draw.
pub const MAX_INDICES: usize = (1 << 16) / 3 * 3;

/// The index list of a quad: two triangles over four vertices.
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 1, 2, 3];

/// Write one vertex in the driver layout.
#[allow(clippy::too_many_arguments)]
pub(crate) fn put_vertex(
    dst: &mut [f32],
    dx: f32,
    dy: f32,
    sx: f32,
    sy: f32,
    bounds: [f32; 4],
    cr: f32,
    cg: f32,
    cb: f32,
    ca: f32,
) {
    dst[0] = dx;
    dst[1] = dy;
    dst[2] = sx;
    dst[3] = sy;
    dst[4] = bounds[0];
    dst[5] = bounds[1];
    dst[6] = bounds[2];
    dst[7] = bounds[3];
    dst[8] = cr;
    dst[9] = cg;
    dst[10] = cb;
    dst[11] = ca;
}

/// Write the four vertices of a quad mapping the source region
/// `(sx0, sy0)-(sx1, sy1)` through the geometry `(a, b, c, d, tx, ty)`,
/// where `x' = a*x + b*y + tx` and `y' = c*x + d*y + ty`.
///
/// The source bounds of every vertex are the source region itself.
pub(crate) fn put_quad_vertices(
    dst: &mut [f32],
    sx0: f32,
    sy0: f32,
    sx1: f32,
    sy1: f32,
    geo: [f32; 6],
    color: [f32; 4],
) {
    debug_assert!(dst.len() >= 4 * VERTEX_FLOAT_COUNT);
    let [a, b, c, d, tx, ty] = geo;
    let [cr, cg, cb, ca] = color;
    let x = sx1 - sx0;
    let y = sy1 - sy0;
    let bounds = [sx0, sy0, sx1, sy1];
    put_vertex(&mut dst[0..], tx, ty, sx0, sy0, bounds, cr, cg, cb, ca);
    put_vertex(
        &mut dst[VERTEX_FLOAT_COUNT..],
        a * x + tx,
        c * x + ty,
        sx1,
        sy0,
        bounds,
        cr,
        cg,
        cb,
        ca,
    );
    put_vertex(
        &mut dst[2 * VERTEX_FLOAT_COUNT..],
        b * y + tx,
        d * y + ty,
        sx0,
        sy1,
        bounds,
        cr,
        cg,
        cb,
        ca,
    );
    put_vertex(
        &mut dst[3 * VERTEX_FLOAT_COUNT..],
        a * x + b * y + tx,
        c * x + d * y + ty,
        sx1,
        sy1,
        bounds,
        cr,
        cg,
        cb,
        ca,
    );
}

/// An owned driver texture that is deleted when dropped.
pub(crate) struct Texture<C: GpuContext + ?Sized> {
    context: Rc<C>,
    resource: Option<C::Texture>,
}

impl<C: GpuContext + ?Sized> Drop for Texture<C> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.context.delete_texture(resource);
        }
    }
}

impl<C: GpuContext + ?Sized> Texture<C> {
    pub(crate) fn from_raw(context: &Rc<C>, resource: C::Texture) -> Self {
        Self {
            context: context.clone(),
            resource: Some(resource),
        }
    }

    pub(crate) fn new(context: &Rc<C>, width: i32, height: i32) -> Result<Self, C::Error> {
        let resource = context.new_texture(width, height)?;
        Ok(Self::from_raw(context, resource))
    }

    pub(crate) fn new_screen_framebuffer(
        context: &Rc<C>,
        width: i32,
        height: i32,
    ) -> Result<Self, C::Error> {
        let resource = context.new_screen_framebuffer_texture(width, height)?;
        Ok(Self::from_raw(context, resource))
    }

    pub(crate) fn resource(&self) -> &C::Texture {
        self.resource.as_ref().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_vertices_identity() {
        let mut vs = [0.0f32; 4 * VERTEX_FLOAT_COUNT];
        put_quad_vertices(
            &mut vs,
            0.0,
            0.0,
            2.0,
            3.0,
            [1.0, 0.0, 0.0, 1.0, 10.0, 20.0],
            [1.0; 4],
        );
        // Destination corners are translated by (10, 20).
        assert_eq!(&vs[0..2], &[10.0, 20.0]);
        assert_eq!(&vs[VERTEX_FLOAT_COUNT..VERTEX_FLOAT_COUNT + 2], &[12.0, 20.0]);
        assert_eq!(
            &vs[2 * VERTEX_FLOAT_COUNT..2 * VERTEX_FLOAT_COUNT + 2],
            &[10.0, 23.0]
        );
        assert_eq!(
            &vs[3 * VERTEX_FLOAT_COUNT..3 * VERTEX_FLOAT_COUNT + 2],
            &[12.0, 23.0]
        );
        // Every vertex carries the same source bounds.
        for i in 0..4 {
            assert_eq!(
                &vs[i * VERTEX_FLOAT_COUNT + 4..i * VERTEX_FLOAT_COUNT + 8],
                &[0.0, 0.0, 2.0, 3.0]
            );
        }
    }

    #[test]
    fn max_indices_is_a_multiple_of_three() {
        assert_eq!(MAX_INDICES % 3, 0);
        assert!(MAX_INDICES <= u16::MAX as usize + 1);
    }
}
