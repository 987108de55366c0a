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

//! The public image handle: sub-image views, mipmaps, pending pixel writes
//! and the drawing entry points.

use crate::color::{Color, ColorM};
use crate::gpu_backend::{
    Address, CompositeMode, Filter, GpuContext, MAX_INDICES, QUAD_INDICES,
};
use crate::mipmap::{self, Mipmap, MAX_MIPMAP_LEVEL};
use crate::shareable;
use crate::{region, ContextState, Region};

use kurbo::Affine;

use std::cell::RefCell;
use std::rc::Rc;

/// A vertex passed to [`Image::draw_triangles`].
///
/// Source coordinates are in the source image's bounds coordinate space, so
/// the top-left of a sub-image is not necessarily `(0, 0)`.
#[derive(Debug, Copy, Clone, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Vertex {
    /// A point on the destination image.
    pub dst_x: f32,
    pub dst_y: f32,

    /// A point on the source image.
    pub src_x: f32,
    pub src_y: f32,

    /// Color scaling values. 1 keeps the source color, 0 makes it
    /// transparent.
    pub color_r: f32,
    pub color_g: f32,
    pub color_b: f32,
    pub color_a: f32,
}

/// Options for [`Image::draw_image`].
#[derive(Debug, Clone)]
pub struct DrawImageOptions {
    /// The geometry transform. The default draws the image at `(0, 0)`.
    pub transform: Affine,

    /// The color transform, applied before the per-vertex color scale.
    pub color_matrix: ColorM,

    /// The composite mode. The default is regular alpha blending.
    pub composite_mode: CompositeMode,

    /// The texture filter. [`Filter::Default`] defers to the filter the
    /// source image was created with, then to [`Filter::Nearest`].
    pub filter: Filter,
}

impl Default for DrawImageOptions {
    fn default() -> Self {
        DrawImageOptions {
            transform: Affine::IDENTITY,
            color_matrix: ColorM::default(),
            composite_mode: CompositeMode::default(),
            filter: Filter::default(),
        }
    }
}

/// Options for [`Image::draw_triangles`].
#[derive(Debug, Clone, Default)]
pub struct DrawTrianglesOptions {
    /// The color transform, applied before the per-vertex color scale.
    pub color_matrix: ColorM,

    /// The composite mode. The default is regular alpha blending.
    pub composite_mode: CompositeMode,

    /// The texture filter. [`Filter::Default`] defers to the filter the
    /// source image was created with, then to [`Filter::Nearest`].
    pub filter: Filter,

    /// The sampler address mode for source coordinates outside the bounds.
    pub address: Address,
}

struct Inner<C: GpuContext + ?Sized> {
    mipmap: Mipmap<C>,

    /// Buffered scalar `set` writes, uploaded before the next draw or read
    /// that needs coherent pixels.
    pending_pixels: Option<Vec<u8>>,
}

/// A rectangle of premultiplied RGBA pixels backed by the texture atlas and
/// restoration machinery.
///
/// Handles are created from a [`Context`](crate::Context). Sub-image handles
/// share the root's pixels and keep them alive; disposing is only meaningful
/// on the root. `Image` is intentionally not `Clone`: one handle owns one
/// logical image.
pub struct Image<C: GpuContext + ?Sized> {
    ctx: Rc<ContextState<C>>,
    inner: Rc<RefCell<Inner<C>>>,

    // Set iff this handle is a sub-image view.
    sub_bounds: Option<Region>,

    filter: Filter,
}

impl<C: GpuContext + ?Sized> Image<C> {
    pub(crate) fn new_root(
        ctx: Rc<ContextState<C>>,
        shareable: shareable::Image<C>,
        filter: Filter,
    ) -> Self {
        Image {
            ctx,
            inner: Rc::new(RefCell::new(Inner {
                mipmap: Mipmap::new(shareable),
                pending_pixels: None,
            })),
            sub_bounds: None,
            filter,
        }
    }

    /// Whether the image has been disposed. Most operations on a disposed
    /// image are no-ops.
    pub fn is_disposed(&self) -> bool {
        self.inner.borrow().mipmap.is_disposed()
    }

    fn is_sub_image(&self) -> bool {
        self.sub_bounds.is_some()
    }

    /// The bounds of the image: `(0, 0)-(w, h)` for a root, the stored
    /// rectangle for a sub-image.
    ///
    /// Panics when the image is disposed.
    pub fn bounds(&self) -> Region {
        assert!(!self.is_disposed(), "image: the image is already disposed");
        match self.sub_bounds {
            Some(r) => r,
            None => {
                let (w, h) = self.inner.borrow().mipmap.original().size();
                region(0, 0, w, h)
            }
        }
    }

    /// The size of the image.
    pub fn size(&self) -> (i32, i32) {
        let b = self.bounds();
        (b.width(), b.height())
    }

    /// A view of the portion of the image visible through `r`, sharing
    /// pixels with this image.
    ///
    /// The bounds of the view are `r` intersected with this image's bounds.
    /// Sub-images are rendering sources only; rendering to one panics.
    pub fn sub_image(&self, r: Region) -> Image<C> {
        let bounds = if self.is_disposed() {
            region(0, 0, 0, 0)
        } else {
            r.intersection(&self.bounds()).unwrap_or(region(0, 0, 0, 0))
        };
        Image {
            ctx: self.ctx.clone(),
            inner: self.inner.clone(),
            sub_bounds: Some(bounds),
            filter: self.filter,
        }
    }

    /// Fill the image with a solid color, replacing its previous content.
    ///
    /// Does nothing when the image is disposed.
    pub fn fill(&self, color: Color) {
        if self.is_disposed() {
            return;
        }
        assert!(
            !self.is_sub_image(),
            "image: render to a sub-image is not supported (fill)"
        );
        self.resolve_pending_pixels(false);

        let (rf, gf, bf, af) = if color.a > 0 {
            (
                color.r as f32 / color.a as f32,
                color.g as f32 / color.a as f32,
                color.b as f32 / color.a as f32,
                color.a as f32 / 255.0,
            )
        } else {
            (0.0, 0.0, 0.0, 0.0)
        };
        let mode = if af < 1.0 {
            CompositeMode::Copy
        } else {
            CompositeMode::SourceOver
        };
        let (dw, dh) = self.size();

        // The fill overwrites every pixel, so the restoring state is
        // redundant from here on.
        self.inner.borrow().mipmap.original().reset_restoring_state();

        let vs = self.ctx.empty.quad_vertices(
            0,
            0,
            1,
            1,
            [dw as f32, 0.0, 0.0, dh as f32, 0.0, 0.0],
            [rf, gf, bf, af],
        );
        let mut inner = self.inner.borrow_mut();
        inner.mipmap.original().draw_triangles(
            &self.ctx.empty,
            vs,
            QUAD_INDICES.to_vec(),
            None,
            mode,
            Filter::Nearest,
            Address::ClampToZero,
        );
        inner.mipmap.dispose_mipmaps();
    }

    /// Reset every pixel to transparent.
    pub fn clear(&self) {
        self.fill(Color::TRANSPARENT);
    }

    /// Draw `src` onto this image.
    ///
    /// Does nothing when this image is disposed; panics when `src` is.
    pub fn draw_image(&self, src: &Image<C>, options: &DrawImageOptions) {
        assert!(
            !src.is_disposed(),
            "image: the source image must not be disposed in draw_image"
        );
        if self.is_disposed() {
            return;
        }
        assert!(
            !self.is_sub_image(),
            "image: render to a sub-image is not supported (draw_image)"
        );
        assert!(
            !Rc::ptr_eq(&self.inner, &src.inner),
            "image: the source image must be different from the target"
        );
        src.resolve_pending_pixels(true);
        self.resolve_pending_pixels(true);

        let bounds = src.bounds();
        if bounds.is_empty() {
            return;
        }
        let det = options.transform.determinant();
        if det == 0.0 || det.is_nan() {
            return;
        }

        let filter = resolve_filter(options.filter, src.filter);
        let mut level = mipmap::mipmap_level(&options.transform, filter)
            .clamp(-MAX_MIPMAP_LEVEL, MAX_MIPMAP_LEVEL);
        if level > 0 {
            // If the source would scale to a zero size at this level, demote
            // the level until it no longer does.
            let (w, h) = (bounds.width(), bounds.height());
            while level >= 0 {
                let s = 1 << level;
                if w / s == 0 || h / s == 0 {
                    level -= 1;
                    continue;
                }
                break;
            }
            if level < 0 {
                // The render source is too small; nothing is rendered.
                return;
            }
        }

        // A scale-only color matrix folds into per-vertex color scales,
        // which lets the driver take a cheaper path.
        let (color_matrix, color_scale) = if options.color_matrix.scale_only() {
            (None, options.color_matrix.scale_elements())
        } else {
            (Some(options.color_matrix.clone()), [1.0; 4])
        };
        let [a, b, c, d, tx, ty] = options.transform.as_coeffs();
        let geo = [a as f32, c as f32, b as f32, d as f32, tx as f32, ty as f32];

        if level == 0 {
            let inner = self.inner.borrow();
            let src_inner = src.inner.borrow();
            let src_orig = src_inner.mipmap.original();
            let vs = src_orig.quad_vertices(
                bounds.min.x,
                bounds.min.y,
                bounds.max.x,
                bounds.max.y,
                geo,
                color_scale,
            );
            inner.mipmap.original().draw_triangles(
                src_orig,
                vs,
                QUAD_INDICES.to_vec(),
                color_matrix,
                options.composite_mode,
                filter,
                Address::ClampToZero,
            );
        } else {
            let mut src_inner = src.inner.borrow_mut();
            if let Some(mip) = src_inner.mipmap.level(bounds, level) {
                let (w, h) = mip.size();
                let s = 2f32.powi(level);
                let geo = [geo[0] * s, geo[1] * s, geo[2] * s, geo[3] * s, geo[4], geo[5]];
                let vs = mip.quad_vertices(0, 0, w, h, geo, color_scale);
                self.inner.borrow().mipmap.original().draw_triangles(
                    mip,
                    vs,
                    QUAD_INDICES.to_vec(),
                    color_matrix,
                    options.composite_mode,
                    filter,
                    Address::ClampToZero,
                );
            }
        }
        self.inner.borrow_mut().mipmap.dispose_mipmaps();
    }

    /// Draw a triangle list sampling `src`. Mipmaps are never used.
    ///
    /// Panics when the index count is not a multiple of 3 or exceeds
    /// [`MAX_INDICES`]. Does nothing when this image is disposed.
    pub fn draw_triangles(
        &self,
        vertices: &[Vertex],
        indices: &[u16],
        src: &Image<C>,
        options: &DrawTrianglesOptions,
    ) {
        if self.is_disposed() {
            return;
        }
        assert!(
            !self.is_sub_image(),
            "image: render to a sub-image is not supported (draw_triangles)"
        );
        assert!(
            !Rc::ptr_eq(&self.inner, &src.inner),
            "image: the source image must be different from the target"
        );
        src.resolve_pending_pixels(true);
        self.resolve_pending_pixels(true);

        assert!(
            indices.len() % 3 == 0,
            "image: len(indices) % 3 must be 0"
        );
        assert!(
            indices.len() <= MAX_INDICES,
            "image: len(indices) must be <= {MAX_INDICES}"
        );

        let filter = resolve_filter(options.filter, src.filter);
        let color_matrix = if options.color_matrix.is_identity() {
            None
        } else {
            Some(options.color_matrix.clone())
        };

        let bounds = src.bounds();
        let mut inner = self.inner.borrow_mut();
        let src_inner = src.inner.borrow();
        let src_orig = src_inner.mipmap.original();
        let vs = src_orig.triangle_vertices(vertices, bounds);
        inner.mipmap.original().draw_triangles(
            src_orig,
            vs,
            indices.to_vec(),
            color_matrix,
            options.composite_mode,
            filter,
            options.address,
        );
        inner.mipmap.dispose_mipmaps();
    }

    /// Replace all pixels with `pixels`, premultiplied RGBA bytes of length
    /// `4 * width * height`. Panics on a length mismatch; does nothing when
    /// the image is disposed.
    pub fn replace_pixels(&self, pixels: &[u8]) {
        if self.is_disposed() {
            return;
        }
        assert!(
            !self.is_sub_image(),
            "image: render to a sub-image is not supported (replace_pixels)"
        );
        self.resolve_pending_pixels(false);
        let (w, h) = self.size();
        let want = 4 * (w * h) as usize;
        assert!(
            pixels.len() == want,
            "image: len(pixels) was {} but must be {}",
            pixels.len(),
            want
        );
        let mut inner = self.inner.borrow_mut();
        inner.mipmap.original().replace_pixels(Some(pixels));
        inner.mipmap.dispose_mipmaps();
    }

    /// Set the color at `(x, y)` in a CPU-side buffer; the buffer is
    /// uploaded before the next draw or read that needs it.
    ///
    /// Panics outside the main loop. Does nothing when the image is
    /// disposed or the coordinates fall outside a sub-image's bounds.
    pub fn set(&self, x: i32, y: i32, color: Color) {
        assert!(
            self.ctx.running.get(),
            "image: set is not available outside the main loop"
        );
        if self.is_disposed() {
            return;
        }
        let Some((x, y)) = self.root_coordinates(x, y) else {
            return;
        };

        let mut inner = self.inner.borrow_mut();
        let (w, h) = inner.mipmap.original().size();
        if x < 0 || y < 0 || x >= w || y >= h {
            return;
        }
        if inner.pending_pixels.is_none() {
            let mut pixels = vec![0u8; 4 * (w * h) as usize];
            for j in 0..h {
                for i in 0..w {
                    let (r, g, b, a) = inner.mipmap.original().at(i, j);
                    let idx = 4 * (j * w + i) as usize;
                    pixels[idx] = r;
                    pixels[idx + 1] = g;
                    pixels[idx + 2] = b;
                    pixels[idx + 3] = a;
                }
            }
            inner.pending_pixels = Some(pixels);
        }
        let pixels = inner.pending_pixels.as_mut().unwrap();
        let idx = 4 * (y * w + x) as usize;
        pixels[idx] = color.r;
        pixels[idx + 1] = color.g;
        pixels[idx + 2] = color.b;
        pixels[idx + 3] = color.a;
    }

    /// The color at `(x, y)`, reading back from the GPU when needed.
    ///
    /// Panics outside the main loop. Returns transparent for a disposed
    /// image or out-of-bounds sub-image coordinates.
    pub fn at(&self, x: i32, y: i32) -> Color {
        assert!(
            self.ctx.running.get(),
            "image: at is not available outside the main loop"
        );
        if self.is_disposed() {
            return Color::TRANSPARENT;
        }
        let Some((x, y)) = self.root_coordinates(x, y) else {
            return Color::TRANSPARENT;
        };
        self.resolve_pending_pixels(true);
        let (r, g, b, a) = self.inner.borrow().mipmap.original().at(x, y);
        Color::rgba(r, g, b, a)
    }

    /// Translate image-local coordinates into the root's space. `None` when
    /// the point falls outside a sub-image's bounds.
    fn root_coordinates(&self, x: i32, y: i32) -> Option<(i32, i32)> {
        match self.sub_bounds {
            None => Some((x, y)),
            Some(b) => {
                if x < 0 || y < 0 || x >= b.width() || y >= b.height() {
                    None
                } else {
                    Some((x + b.min.x, y + b.min.y))
                }
            }
        }
    }

    /// Release the image data. Disposing a sub-image is a no-op; disposing
    /// twice is a no-op.
    pub fn dispose(&self) {
        if self.is_disposed() || self.is_sub_image() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        inner.mipmap.dispose();
        inner.pending_pixels = None;
    }

    /// Make the image volatile: it is cleared at every frame boundary, keeps
    /// no restoration history and is never promoted to a shared atlas.
    /// Suited to offscreen images whose pixels change every frame.
    pub fn make_volatile(&self) {
        if self.is_disposed() {
            return;
        }
        assert!(
            !self.is_sub_image(),
            "image: make_volatile is not supported on a sub-image"
        );
        let mut inner = self.inner.borrow_mut();
        inner.mipmap.original().make_volatile();
        inner.mipmap.dispose_mipmaps();
    }

    /// Whether the image currently lives in a shared atlas.
    pub fn is_shared_for_testing(&self) -> bool {
        self.inner.borrow().mipmap.original().is_shared_for_testing()
    }

    fn resolve_pending_pixels(&self, draw: bool) {
        let mut inner = self.inner.borrow_mut();
        let Some(pixels) = inner.pending_pixels.take() else {
            return;
        };
        if draw {
            inner.mipmap.original().replace_pixels(Some(&pixels));
            inner.mipmap.dispose_mipmaps();
        }
    }
}

fn resolve_filter(op_filter: Filter, image_filter: Filter) -> Filter {
    if op_filter != Filter::Default {
        op_filter
    } else if image_filter != Filter::Default {
        image_filter
    } else {
        Filter::Nearest
    }
}
