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

//! GPU image management for 2D rendering.
//!
//! This crate turns user-visible image handles into GPU-backed textures. It
//! packs small images into large shared atlas textures, records a drawing
//! history per texture so everything can be rebuilt after a GPU context
//! loss, and schedules when images migrate between private and shared
//! storage.
//!
//! To use, implement the [`GpuContext`] trait for your graphics driver and
//! create a [`Context`] from it. The context hands out [`Image`] handles;
//! call [`Context::begin_frame`] and [`Context::end_frame`] around each
//! frame so images promote into atlases and pending readbacks resolve, and
//! call [`Context::restore_if_needed`] when the driver reports a device
//! loss.
//!
//! Note that this crate uses thread-unsafe primitives throughout. Rendering
//! is usually pinned to one thread anyway, and handles dropped on that
//! thread release their GPU resources deterministically.
//!
//! ## Implementation
//!
//! Four layers, each exposing a restricted surface to the one above: a
//! rectangle packer (`packing`), restorable textures that record their
//! drawing history (`restorable`), shareable images with a
//! promotion/demotion policy (`shareable`), and the public image façade
//! with sub-images, mipmaps and a pending-pixel buffer (`image`).

#![forbid(unsafe_code, rust_2018_idioms)]

use std::cell::Cell;
use std::rc::Rc;

mod color;
mod gpu_backend;
mod image;
mod mipmap;
mod packing;
mod restorable;
mod shareable;
#[cfg(test)]
mod testing;

pub use kurbo;

pub use self::color::{Color, ColorM};
pub use self::gpu_backend::{
    Address, CompositeMode, Filter, GpuContext, MAX_INDICES, VERTEX_FLOAT_COUNT,
};
pub use self::image::{DrawImageOptions, DrawTrianglesOptions, Image, Vertex};
pub use self::shareable::MAX_COUNT_FOR_SHARE;

/// An axis-aligned integer rectangle, min-inclusive and max-exclusive.
pub type Region = euclid::default::Box2D<i32>;

pub(crate) fn region(x: i32, y: i32, width: i32, height: i32) -> Region {
    Region::new(euclid::point2(x, y), euclid::point2(x + width, y + height))
}

/// The maximum width and height of an [`Image`].
pub const MAX_IMAGE_SIZE: i32 = 4096;

/// Errors surfaced by the restore entry points. Driver errors raised inside
/// other entry points are latched; see [`Context::take_error`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The graphics driver reported an error.
    #[error("graphics driver error: {0}")]
    Driver(Box<dyn std::error::Error + 'static>),

    /// A stale image was encountered during a restore. Stale images must be
    /// resolved (end of frame) before the device loss.
    #[error("stale images cannot be restored; resolve stale images first")]
    StaleRestore,
}

pub(crate) struct ContextState<C: GpuContext + ?Sized> {
    pub(crate) gfx: Rc<restorable::Graphics<C>>,
    pub(crate) atlases: Rc<shareable::Atlases<C>>,
    pub(crate) running: Cell<bool>,

    /// A 1x1 white image backing solid fills. Its pixels are written, never
    /// filled: `fill` itself draws from this image.
    pub(crate) empty: shareable::Image<C>,
}

/// The graphics context: the single owner of the atlas backends, the image
/// registry, the promotion schedule and the driver handle.
///
/// Every image handle keeps the state alive, so the context value itself may
/// be dropped while images live on.
pub struct Context<C: GpuContext + ?Sized> {
    state: Rc<ContextState<C>>,
}

impl<C: GpuContext + ?Sized> Clone for Context<C> {
    fn clone(&self) -> Self {
        Context {
            state: self.state.clone(),
        }
    }
}

impl<C: GpuContext + ?Sized> Context<C> {
    /// Create a context from a driver.
    pub fn new(driver: C) -> Self
    where
        C: Sized,
    {
        const WHITE: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

        let gfx = restorable::Graphics::new(Rc::new(driver));
        let atlases = shareable::Atlases::new(gfx.clone());
        let empty = shareable::Image::new(&atlases, 1, 1);
        empty.replace_pixels(Some(&WHITE));
        Context {
            state: Rc::new(ContextState {
                gfx,
                atlases,
                running: Cell::new(false),
                empty,
            }),
        }
    }

    /// Create an empty image. Panics when a dimension is outside
    /// `1..=MAX_IMAGE_SIZE`.
    pub fn new_image(&self, width: i32, height: i32, filter: Filter) -> Image<C> {
        validate_size(width, height);
        let shareable = shareable::Image::new(&self.state.atlases, width, height);
        Image::new_root(self.state.clone(), shareable, filter)
    }

    /// Create an image from premultiplied RGBA bytes. Panics when a
    /// dimension is out of range or the pixel length is not
    /// `4 * width * height`.
    pub fn new_image_from_pixels(
        &self,
        width: i32,
        height: i32,
        pixels: &[u8],
        filter: Filter,
    ) -> Image<C> {
        let img = self.new_image(width, height, filter);
        img.replace_pixels(pixels);
        img
    }

    /// Create the image representing the screen framebuffer. It is never
    /// shared, and restoration re-creates its texture without re-uploading
    /// pixels.
    pub fn new_screen_framebuffer_image(&self, width: i32, height: i32) -> Image<C> {
        validate_size(width, height);
        let shareable =
            shareable::Image::new_screen_framebuffer(&self.state.atlases, width, height);
        Image::new_root(self.state.clone(), shareable, Filter::Default)
    }

    /// The before-update hook: clears volatile images and runs the
    /// promotion pass over the shared-atlas candidates.
    pub fn begin_frame(&self) {
        self.state.gfx.images.clear_volatile_images();
        self.state.atlases.make_images_shared();
    }

    /// The after-update hook: flushes queued commands and resolves stale
    /// images by reading their pixels back.
    pub fn end_frame(&self) {
        self.state.gfx.resolve_stale_images();
    }

    /// Restore all images when the driver reports a device loss, replaying
    /// recorded histories in dependency order.
    pub fn restore_if_needed(&self) -> Result<(), Error> {
        self.state.gfx.restore_if_needed()
    }

    /// Reset the graphics driver state.
    pub fn initialize_driver_state(&self) -> Result<(), Error> {
        self.state
            .gfx
            .driver
            .reset_state()
            .map_err(|e| Error::Driver(Box::new(e)))
    }

    /// Mark the main loop as running. [`Image::at`] and [`Image::set`] are
    /// only available while it is.
    pub fn set_running(&self, running: bool) {
        self.state.running.set(running);
    }

    /// The first driver error latched by an entry point that cannot return
    /// one, if any. Taking it clears the latch.
    pub fn take_error(&self) -> Option<Error> {
        self.state.gfx.take_error()
    }

    /// Force the restoration machinery on, whatever the driver reports.
    pub fn enable_restoring_for_testing(&self) {
        self.state.gfx.enable_restoring_for_testing();
    }

    /// Run the promotion pass immediately instead of waiting for a frame
    /// boundary.
    pub fn force_share_pass(&self) {
        self.state.atlases.make_images_shared();
    }
}

fn validate_size(width: i32, height: i32) {
    assert!(
        width >= 1 && height >= 1,
        "image: width and height must be at least 1"
    );
    assert!(
        width <= MAX_IMAGE_SIZE && height <= MAX_IMAGE_SIZE,
        "image: width and height must be at most {MAX_IMAGE_SIZE}"
    );
}
