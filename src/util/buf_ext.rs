use anyhow::anyhow;

pub trait BufExt: bytes::Buf {
    /// Like `copy_to_bytes`, but returning an error instead of panicking if the buffer is too short.
    ///  Nothing is consumed in that case.
    fn try_get_vec(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: {} bytes requested, {} remaining", len, self.remaining()));
        }
        let mut result = vec![0u8; len];
        self.copy_to_slice(&mut result);
        Ok(result)
    }
}

impl <T: bytes::Buf> BufExt for T {
}
