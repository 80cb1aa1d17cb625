/// NVMe spec 4.x: opcodes whose data transfer direction the host needs to
/// know. Bits 1:0 of every opcode encode the direction.
pub mod opcode {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_ZEROES: u8 = 0x08;
    pub const DATASET_MANAGEMENT: u8 = 0x09;

    // admin
    pub const GET_LOG_PAGE: u8 = 0x02;
    pub const IDENTIFY: u8 = 0x06;
    pub const SET_FEATURES: u8 = 0x09;
    pub const GET_FEATURES: u8 = 0x0a;
}

/// Direction of the data phase of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransfer {
    None,
    HostToController,
    ControllerToHost,
    Bidirectional,
}

impl DataTransfer {
    #[inline]
    pub fn from_opcode(opc: u8) -> Self {
        match opc & 0x3 {
            0 => DataTransfer::None,
            1 => DataTransfer::HostToController,
            2 => DataTransfer::ControllerToHost,
            _ => DataTransfer::Bidirectional,
        }
    }

    /// Device writes into host memory, so a bounce buffer has to be copied
    /// back out once the command completes.
    #[inline]
    pub fn reads_from_device(&self) -> bool {
        matches!(
            self,
            DataTransfer::ControllerToHost | DataTransfer::Bidirectional
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opc_data_transfer() {
        assert_eq!(DataTransfer::from_opcode(opcode::FLUSH), DataTransfer::None);
        assert_eq!(
            DataTransfer::from_opcode(opcode::WRITE),
            DataTransfer::HostToController
        );
        assert_eq!(
            DataTransfer::from_opcode(opcode::READ),
            DataTransfer::ControllerToHost
        );
        assert_eq!(
            DataTransfer::from_opcode(opcode::GET_LOG_PAGE),
            DataTransfer::ControllerToHost
        );
        assert_eq!(
            DataTransfer::from_opcode(0x03),
            DataTransfer::Bidirectional
        );
    }
}
