use byteorder::{ByteOrder, LittleEndian};

/// NVMe spec 4.6
/// Completion queue entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct NvmeCompletion {
    /// Command specific
    pub command_specific: u32,
    /// Reserved
    pub _rsvd: u32,
    // Submission queue head
    pub sq_head: u16,
    // Submission queue ID
    pub sq_id: u16,
    // Command ID
    pub c_id: u16,
    //  Status field, phase tag in bit 0
    pub status: u16,
}

pub const COMPLETION_ENTRY_SIZE: usize = 16;

/// Generic command status
pub const SCT_GENERIC: u8 = 0;
pub const SC_SUCCESS: u8 = 0x00;
pub const SC_INTERNAL_DEVICE_ERROR: u8 = 0x06;
pub const SC_ABORTED_SQ_DELETION: u8 = 0x08;

impl NvmeCompletion {
    /// Successful completion for command `c_id`.
    pub fn success(c_id: u16) -> Self {
        Self {
            c_id,
            ..Default::default()
        }
    }

    /// Completion for `c_id` carrying the given status code type and code.
    pub fn with_status(c_id: u16, sct: u8, sc: u8) -> Self {
        Self {
            c_id,
            status: ((sct as u16 & 0x7) << 9) | ((sc as u16) << 1),
            ..Default::default()
        }
    }

    /// Decode a little-endian completion queue entry.
    pub fn from_bytes(buf: &[u8; COMPLETION_ENTRY_SIZE]) -> Self {
        Self {
            command_specific: LittleEndian::read_u32(&buf[0..4]),
            _rsvd: LittleEndian::read_u32(&buf[4..8]),
            sq_head: LittleEndian::read_u16(&buf[8..10]),
            sq_id: LittleEndian::read_u16(&buf[10..12]),
            c_id: LittleEndian::read_u16(&buf[12..14]),
            status: LittleEndian::read_u16(&buf[14..16]),
        }
    }

    pub fn to_bytes(&self) -> [u8; COMPLETION_ENTRY_SIZE] {
        let mut buf = [0u8; COMPLETION_ENTRY_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.command_specific);
        LittleEndian::write_u32(&mut buf[4..8], self._rsvd);
        LittleEndian::write_u16(&mut buf[8..10], self.sq_head);
        LittleEndian::write_u16(&mut buf[10..12], self.sq_id);
        LittleEndian::write_u16(&mut buf[12..14], self.c_id);
        LittleEndian::write_u16(&mut buf[14..16], self.status);
        buf
    }

    #[inline]
    pub fn phase(&self) -> bool {
        self.status & 1 == 1
    }

    #[inline]
    pub fn status_code(&self) -> u8 {
        ((self.status >> 1) & 0xff) as u8
    }

    #[inline]
    pub fn status_code_type(&self) -> u8 {
        ((self.status >> 9) & 0x7) as u8
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.status_code() != SC_SUCCESS || self.status_code_type() != SCT_GENERIC
    }
}

/// Source of hardware completions for one queue pair.
///
/// Implemented by the transport's reaping side; the queue pair matches each
/// entry's command id back to the originating request.
pub trait CompletionSource {
    fn reap(&mut self) -> Option<NvmeCompletion>;
}

impl CompletionSource for std::collections::VecDeque<NvmeCompletion> {
    fn reap(&mut self) -> Option<NvmeCompletion> {
        self.pop_front()
    }
}
