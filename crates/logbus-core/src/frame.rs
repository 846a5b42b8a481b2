//! On-buffer frame descriptor.
//!
//! Every entry in a partition is a *frame*: a fixed header followed by the
//! payload, padded to the frame alignment so that header fields can always be
//! accessed with aligned atomic loads and stores.
//!
//! ## Layout
//!
//! ```text
//! offset  0        4        5           8              12
//!         ┌────────┬────────┬───────────┬───────────────┬──────────────┐
//!         │ length │ flags  │ reserved  │   stream id   │   payload    │
//!         │  i32   │  u8    │  3 bytes  │      i32      │ length-12 B  │
//!         └────────┴────────┴───────────┴───────────────┴──────────────┘
//!         [ ... padded to the next multiple of 8 bytes ................]
//! ```
//!
//! The `length` field doubles as the commit marker: a *negative* length is a
//! claim in progress, zero means nothing has been written here yet, and a
//! positive length publishes the frame. It is always written last, with
//! release ordering, and read first, with acquire ordering.
//!
//! A padding frame carries [`FLAG_PADDING`] and a length spanning to the end
//! of the partition; readers skip it and hop to the next partition. Padding
//! only ever needs the first 8 bytes of the header, which is why `flags` sits
//! in the first word: the residue at the end of a partition is always a
//! multiple of [`FRAME_ALIGNMENT`] and may be as small as 8 bytes.

/// Alignment of every frame, in bytes. Matches the platform atomic word.
pub const FRAME_ALIGNMENT: i32 = 8;

/// Length of the frame header, in bytes.
pub const HEADER_LENGTH: i32 = 12;

/// Byte offset of the `length` field within a frame.
pub const LENGTH_OFFSET: i32 = 0;

/// Byte offset of the `flags` field within a frame.
pub const FLAGS_OFFSET: i32 = 4;

/// Byte offset of the `stream id` field within a frame.
pub const STREAM_ID_OFFSET: i32 = 8;

/// Flag marking a padding frame. Readers skip the frame without delivering it.
pub const FLAG_PADDING: u8 = 0x01;

/// Flag marking a non-final fragment of a batch claim.
pub const FLAG_BATCH_CONTINUATION: u8 = 0x02;

/// Rounds `length` up to the next multiple of [`FRAME_ALIGNMENT`].
#[inline]
#[must_use]
pub const fn align_frame_length(length: i32) -> i32 {
    (length + (FRAME_ALIGNMENT - 1)) & !(FRAME_ALIGNMENT - 1)
}

/// Total frame length for a payload of `payload_length` bytes, unaligned.
///
/// # Panics
///
/// Panics if the payload does not fit in an `i32` frame. Callers reject
/// oversized payloads long before this bound is reached.
#[inline]
#[must_use]
pub fn frame_length(payload_length: usize) -> i32 {
    let payload = i32::try_from(payload_length).expect("payload length exceeds frame encoding");
    HEADER_LENGTH + payload
}

/// Offset of the payload for a frame starting at `frame_offset`.
#[inline]
#[must_use]
pub const fn payload_offset(frame_offset: i32) -> i32 {
    frame_offset + HEADER_LENGTH
}

/// Offset of the `length` field for a frame starting at `frame_offset`.
#[inline]
#[must_use]
pub const fn length_offset(frame_offset: i32) -> i32 {
    frame_offset + LENGTH_OFFSET
}

/// Offset of the `flags` field for a frame starting at `frame_offset`.
#[inline]
#[must_use]
pub const fn flags_offset(frame_offset: i32) -> i32 {
    frame_offset + FLAGS_OFFSET
}

/// Offset of the `stream id` field for a frame starting at `frame_offset`.
#[inline]
#[must_use]
pub const fn stream_id_offset(frame_offset: i32) -> i32 {
    frame_offset + STREAM_ID_OFFSET
}
