use anyhow::{ensure, Result};

use std::io::{BufRead, Read};

/// Fixed-width little-endian reads shared by every binary consumer in the
/// crate. COF is little-endian throughout, so these are the only integer
/// decoders that exist.
pub trait CoilRead: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut data = [0; 1];
        self.read_exact(&mut data)?;
        Ok(data[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut data = [0; 2];
        self.read_exact(&mut data)?;
        Ok(u16::from_le_bytes(data))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut data = [0; 4];
        self.read_exact(&mut data)?;
        Ok(u32::from_le_bytes(data))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let mut data = [0; 4];
        self.read_exact(&mut data)?;
        Ok(i32::from_le_bytes(data))
    }

    /// A register index or string-table offset on the wire: 3 bytes,
    /// little-endian, zero-extended.
    fn read_u24(&mut self) -> Result<u32> {
        let mut data = [0; 3];
        self.read_exact(&mut data)?;
        Ok(u32::from_le_bytes([data[0], data[1], data[2], 0]))
    }

    /// An immediate on the wire: 3 bytes, little-endian, sign-extended to
    /// 64 bits.
    fn read_i24(&mut self) -> Result<i64> {
        let mut data = [0; 3];
        self.read_exact(&mut data)?;
        let extend = if data[2] & 0x80 != 0 { 0xFF } else { 0 };
        Ok(i64::from_le_bytes([
            data[0], data[1], data[2], extend, extend, extend, extend, extend,
        ]))
    }
}

impl<R: Read> CoilRead for R {}

pub trait CoilBufRead: CoilRead + BufRead {
    fn read_c_string_raw(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![];
        self.read_until(b'\x00', &mut buf)?;
        // last char need to be \x00 or we found a EoF
        ensure!(buf.pop() == Some(b'\x00'), "Unexpected EoF on CStr");
        Ok(buf)
    }
}

impl<R: CoilRead + BufRead> CoilBufRead for R {}
