//! Protocol constants for the NTCP transport.
//!
//! Wire sizes are fixed by the protocol and MUST NOT be changed; peers
//! running other implementations rely on them byte for byte.

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC SIZES
// =============================================================================

/// SHA-256 output size, also the size of a router hash.
pub const HASH_SIZE: usize = 32;

/// AES block size (CBC chaining unit).
pub const AES_BLOCK_SIZE: usize = 16;

/// AES-256 / ChaCha20 / X25519 key size.
pub const KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size.
pub const MAC_SIZE: usize = 16;

/// Size of the published NTCP2 AES IV.
pub const IV_SIZE: usize = 16;

/// Ed25519 signature length.
pub const SIGNATURE_SIZE: usize = 64;

// =============================================================================
// LEGACY HANDSHAKE (variant A)
// =============================================================================

/// Size of a 2048-bit DH public value.
pub const XY_SIZE: usize = 256;

/// Size of `H(X) ^ H(Bob)` and of `H(X || Y)`.
pub const HXY_SIZE: usize = 32;

/// Encrypted `H(X || Y) || tsB || padding` in message 2.
pub const HXY_TSB_PAD_SIZE: usize = HXY_SIZE + 4 + 12;

/// Size of legacy message 1.
pub const NTCP1_MSG1_SIZE: usize = XY_SIZE + HXY_SIZE;

/// Size of legacy message 2.
pub const NTCP1_MSG2_SIZE: usize = XY_SIZE + HXY_TSB_PAD_SIZE;

/// Smallest acceptable router identity in message 3.
pub const MIN_RI_SIZE: usize = 387;

/// Largest acceptable router identity in message 3.
pub const MAX_RI_SIZE: usize = 2048;

/// Replay cache entries are kept this long.
pub const REPLAY_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Peers failing the legacy skew check are banned this long.
pub const SKEW_BAN_DURATION: Duration = Duration::from_secs(7 * 60);

/// Number of leading bytes of the msg1 XOR field used as the replay key.
pub const REPLAY_KEY_SIZE: usize = 8;

// =============================================================================
// NOISE HANDSHAKE (variant B)
// =============================================================================

/// Protocol name hashed into the initial Noise state.
pub const NOISE_PROTOCOL_NAME: &[u8] = b"Noise_XKaesobfse+hs2+hs3_25519_ChaChaPoly_SHA256";

/// Version byte carried in the msg1 options.
pub const NTCP2_INT_VERSION: u8 = 2;

/// Options block in message 1.
pub const OPTIONS1_SIZE: usize = 16;

/// Message 1 without padding.
pub const MSG1_SIZE: usize = KEY_SIZE + OPTIONS1_SIZE + MAC_SIZE;

/// Largest message 1 including padding; one less than legacy message 1.
pub const TOTAL1_MAX: usize = NTCP1_MSG1_SIZE - 1;

/// Upper bound (exclusive) of randomly chosen msg1 padding.
pub const PADDING1_MAX: usize = 64;

/// Upper bound (exclusive) of bytes absorbed after a failed message 1.
pub const PADDING1_FAIL_MAX: usize = 128;

/// Upper bound (exclusive) of randomly chosen msg2 padding.
pub const PADDING2_MAX: usize = 64;

/// Upper bound (exclusive) of randomly chosen msg3 padding block.
pub const PADDING3_MAX: usize = 64;

/// Options block in message 2.
pub const OPTIONS2_SIZE: usize = 16;

/// Message 2 without padding.
pub const MSG2_SIZE: usize = KEY_SIZE + OPTIONS2_SIZE + MAC_SIZE;

/// Message 3 part 1: encrypted static key plus MAC.
pub const MSG3P1_SIZE: usize = KEY_SIZE + MAC_SIZE;

/// Data phase options block carried in message 3 and OPTIONS blocks.
pub const OPTIONS3_SIZE: usize = 12;

/// Maximum clock skew tolerated by the Noise handshake, in seconds.
pub const MAX_SKEW_SECS: i64 = 60;

// =============================================================================
// PAYLOAD BLOCKS (variant B)
// =============================================================================

/// Block header: 1 byte type, 2 bytes length.
pub const BLOCK_HEADER_SIZE: usize = 3;

/// DATETIME block type.
pub const BLOCK_DATETIME: u8 = 0;

/// OPTIONS block type.
pub const BLOCK_OPTIONS: u8 = 1;

/// ROUTERINFO block type.
pub const BLOCK_ROUTERINFO: u8 = 2;

/// I2NP message block type.
pub const BLOCK_I2NP: u8 = 3;

/// TERMINATION block type.
pub const BLOCK_TERMINATION: u8 = 4;

/// PADDING block type.
pub const BLOCK_PADDING: u8 = 254;

/// TERMINATION payload size: 8 byte frame count plus 1 byte reason.
pub const TERMINATION_SIZE: usize = 9;

/// Largest variant-B data frame (after the length field).
pub const NTCP2_MAX_FRAME_SIZE: usize = 65535;

// =============================================================================
// DATA PHASE (variant A)
// =============================================================================

/// Largest unencrypted legacy frame.
pub const BUFFER_SIZE: usize = 16 * 1024;

/// Largest message that fits in a legacy frame (size prefix and checksum excluded).
pub const MAX_MSG_SIZE: usize = BUFFER_SIZE - (2 + 4);

/// Legacy keepalive ("meta") frame size.
pub const META_SIZE: usize = AES_BLOCK_SIZE;

// =============================================================================
// CLOCK
// =============================================================================

/// Skew at which peers are considered broken, in milliseconds.
pub const CLOCK_FUDGE_FACTOR_MS: i64 = 60 * 1000;

// =============================================================================
// CONNECTION
// =============================================================================

/// Handshakes older than this are closed by the expiry sweep.
pub const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of queued messages inspected when picking the next by priority.
pub const PRIORITY_SCAN_LIMIT: usize = 75;

/// Once the queue head has waited this long, send in plain FIFO order.
pub const FIFO_AFTER: Duration = Duration::from_secs(3);

/// Queue time after which the connection counts as backlogged.
pub const BACKLOG_QUEUE_TIME: Duration = Duration::from_secs(5);

/// Backlog is not evaluated during this grace period after establishment.
pub const BACKLOG_GRACE: Duration = Duration::from_secs(10);

/// Consecutive backlogged sends tolerated before the connection is closed.
pub const MAX_CONSECUTIVE_BACKLOG: u32 = 10;

/// Default interval between keepalive frames.
pub const META_FREQUENCY: Duration = Duration::from_secs(10 * 60);

// =============================================================================
// PUMPER
// =============================================================================

/// Size of a pooled read buffer.
pub const READ_BUF_SIZE: usize = 8 * 1024;

/// Maximum pooled read buffers kept around.
pub const MAX_BUF_CACHE: usize = 64;

/// Consecutive zero-length reads before a connection is dropped.
pub const MAX_ZERO_READS: u32 = 5;
