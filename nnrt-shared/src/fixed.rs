// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-point conversion for engine elements.
//!
//! Elements carry a binary point that the network configuration encodes as
//! an offset from the engine's `DECIMAL_POINT_OFFSET`.

use crate::Element;

/// Most fractional bits an element can carry and keep its sign bit.
pub const MAX_DECIMAL_POINT: u32 = Element::BITS - 1;

// 2^decimal_point, with the binary point clamped to MAX_DECIMAL_POINT.
fn scale(decimal_point: u32) -> f32 { (1u64 << decimal_point.min(MAX_DECIMAL_POINT)) as f32 }

/// Converts |value| to an element with |decimal_point| fractional bits.
/// Fractional bits beyond the element's precision are truncated; values out
/// of range saturate.
pub fn to_fixed(value: f32, decimal_point: u32) -> Element { (value * scale(decimal_point)) as Element }

pub fn from_fixed(element: Element, decimal_point: u32) -> f32 { element as f32 / scale(decimal_point) }

/// Absolute binary point for an encoded 3-bit decimal-point field, clamped
/// to [MAX_DECIMAL_POINT].
pub fn decimal_point(offset: u32, encoded: u32) -> u32 {
    offset.saturating_add(encoded).min(MAX_DECIMAL_POINT)
}
