use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;

use api_types::DeviceClass;

use super::DeviceApi;
use super::DeviceDescriptor;
use super::DeviceHandle;
use super::RawStatus;

/// Byte offset of the vendor status region on the namespace device
pub const STATUS_REGION_OFFSET: u64 = 0x0010_0000;
/// Hardware sub-index slots per device class
pub const HW_SLOTS: u64 = 4;
/// Distance between two status records
pub const STATUS_STRIDE: u64 = 4096;
/// current_load, fw_model_load, fw_video_mem_usage, total_contexts
const STATUS_RECORD_LEN: usize = 16;

/// Reads load status straight from the namespace block device.
#[derive(Debug, Clone, Copy)]
pub struct BlockDeviceApi {
    status_offset: u64,
}

impl BlockDeviceApi {
    pub fn new() -> Self {
        Self {
            status_offset: STATUS_REGION_OFFSET,
        }
    }

    /// Uses a different base for the status region.
    pub fn with_status_offset(status_offset: u64) -> Self {
        Self { status_offset }
    }
}

impl Default for BlockDeviceApi {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceApi for BlockDeviceApi {
    type Handle = BlockHandle;

    fn open(&self, descriptor: &DeviceDescriptor) -> io::Result<Self::Handle> {
        let file = OpenOptions::new().read(true).open(&descriptor.blk_name)?;
        Ok(BlockHandle {
            file,
            status_offset: self.status_offset,
        })
    }
}

pub struct BlockHandle {
    file: File,
    status_offset: u64,
}

impl BlockHandle {
    fn record_offset(&self, class: DeviceClass, hw_id: i32) -> io::Result<u64> {
        let hw_id = u64::try_from(hw_id)
            .ok()
            .filter(|&id| id < HW_SLOTS)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("hardware sub-index {hw_id} out of range"),
                )
            })?;

        let slot = class.slot() as u64 * HW_SLOTS + hw_id;
        Ok(self.status_offset + slot * STATUS_STRIDE)
    }
}

impl DeviceHandle for BlockHandle {
    fn query_status(&mut self, class: DeviceClass, hw_id: i32) -> io::Result<RawStatus> {
        let offset = self.record_offset(class, hw_id)?;
        let mut buf = [0u8; STATUS_RECORD_LEN];
        self.file.read_exact_at(&mut buf, offset)?;

        let field = |i: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            u32::from_le_bytes(word)
        };

        Ok(RawStatus {
            current_load: field(0),
            fw_model_load: field(1),
            fw_video_mem_usage: field(2),
            total_contexts: field(3),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn status_bytes(values: [u32; 4]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn descriptor(path: &std::path::Path) -> DeviceDescriptor {
        DeviceDescriptor {
            module_id: 0,
            dev_name: "/dev/nvme0".to_string(),
            blk_name: path.to_string_lossy().into_owned(),
            hw_id: 0,
        }
    }

    /// Lays out a status region holding `records` at their (class, hw_id) slots.
    fn fake_namespace(records: &[(DeviceClass, u64, [u32; 4])]) -> NamedTempFile {
        let len = (2 * HW_SLOTS * STATUS_STRIDE) as usize;
        let mut image = vec![0u8; len];
        for (class, hw_id, values) in records {
            let at = ((class.slot() as u64 * HW_SLOTS + hw_id) * STATUS_STRIDE) as usize;
            image[at..at + STATUS_RECORD_LEN].copy_from_slice(&status_bytes(*values));
        }

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        file
    }

    #[test]
    fn reads_status_record_for_class_and_slot() {
        let file = fake_namespace(&[
            (DeviceClass::Decoder, 0, [11, 12, 13, 1]),
            (DeviceClass::Encoder, 0, [21, 22, 23, 2]),
            (DeviceClass::Encoder, 1, [31, 32, 33, 3]),
        ]);
        let api = BlockDeviceApi::with_status_offset(0);
        let mut handle = api.open(&descriptor(file.path())).unwrap();

        assert_eq!(
            handle.query_status(DeviceClass::Decoder, 0).unwrap(),
            RawStatus {
                current_load: 11,
                fw_model_load: 12,
                fw_video_mem_usage: 13,
                total_contexts: 1,
            }
        );
        assert_eq!(
            handle.query_status(DeviceClass::Encoder, 0).unwrap().current_load,
            21
        );
        assert_eq!(
            handle
                .query_status(DeviceClass::Encoder, 1)
                .unwrap()
                .total_contexts,
            3
        );
    }

    #[test]
    fn short_read_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1, 0, 0, 0, 2, 0]).unwrap();

        let api = BlockDeviceApi::with_status_offset(0);
        let mut handle = api.open(&descriptor(file.path())).unwrap();
        let err = handle.query_status(DeviceClass::Decoder, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn out_of_range_hw_id_is_rejected() {
        let file = fake_namespace(&[]);
        let api = BlockDeviceApi::with_status_offset(0);
        let mut handle = api.open(&descriptor(file.path())).unwrap();

        for hw_id in [-1, HW_SLOTS as i32] {
            let err = handle.query_status(DeviceClass::Decoder, hw_id).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn missing_namespace_fails_to_open() {
        let api = BlockDeviceApi::default();
        let result = api.open(&descriptor(std::path::Path::new("/nonexistent/nvme9n1")));
        assert!(result.is_err());
    }
}
