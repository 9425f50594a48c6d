// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Control-block placement.
//!
//! A fiber's control block lives at the top of its own stack region. Given
//! the region and the block's layout, `place` computes where the block goes
//! and how many bytes are left below it for the fiber to run on:
//!
//! ```text
//!  bottom                                       address        top
//!    |<------------- residual_size ------------->|<- block ->|..|
//!    [ usable execution stack (grows down)       ][ control  ]  slack
//! ```
//!
//! Everything here is integer arithmetic on addresses. A region that cannot
//! hold the block is a configuration error and trips an assertion.

use std::alloc::Layout;

use crate::stack::STACK_ALIGN;

/// Where the control block goes and what is left for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Address of the first byte of the control block.
    pub address: usize,
    /// Bytes in `[top - size, address)`.
    pub residual_size: usize,
}

/// How the control block is positioned under the top of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementStrategy {
    /// Reserve `size + align` bytes and align inside that window.
    #[default]
    Aligned,
    /// Reserve exactly `size` bytes directly under the top. Only valid when
    /// the block needs no more than the natural stack alignment.
    Packed,
}

/// Compute the control-block placement for the region `[top - size, top)`.
///
/// # Panics
///
/// If the block does not fit inside the region, or if `Packed` is used with
/// a layout or top pointer it cannot satisfy.
pub fn place(top: usize, size: usize, layout: Layout, strategy: PlacementStrategy) -> Placement {
    let bottom = top
        .checked_sub(size)
        .expect("stack region wraps below address zero");

    let address = match strategy {
        PlacementStrategy::Aligned => {
            let window = layout
                .size()
                .checked_add(layout.align())
                .expect("control block reservation overflows");
            let start = top
                .checked_sub(window)
                .expect("control block reservation underflows the address space");
            align_up(start, layout.align())
        }
        PlacementStrategy::Packed => {
            assert!(
                layout.align() <= STACK_ALIGN,
                "packed placement needs alignment <= {STACK_ALIGN}, got {}",
                layout.align()
            );
            assert!(
                top % STACK_ALIGN == 0,
                "packed placement needs a {STACK_ALIGN}-byte aligned top of stack"
            );
            top.checked_sub(layout.size())
                .expect("control block reservation underflows the address space")
        }
    };

    assert!(
        address >= bottom && address + layout.size() <= top,
        "stack region of {size} bytes cannot hold a {}-byte control block",
        layout.size()
    );

    let consumed = top - address;
    let residual_size = size
        .checked_sub(consumed)
        .expect("control block consumes more than the whole region");

    Placement {
        address,
        residual_size,
    }
}

fn align_up(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr.checked_add(align - 1)
        .expect("aligned address overflows")
        & !(align - 1)
}
