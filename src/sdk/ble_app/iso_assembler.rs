use heapless::{FnvIndexMap, Vec};
use tracing::debug;

use crate::config::{MAX_BIS, MAX_SDU_LEN};
use crate::sdk::packet_types::FramedSegHeader;

/// Output of the framed assembler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramedEvent<'a> {
    Sdu { data: &'a [u8], time_offset: u32 },
    Lost,
}

#[derive(Debug, Default)]
struct FramedState {
    active: bool,
    time_offset: u32,
    sdu: Vec<u8, MAX_SDU_LEN>,
}

impl FramedState {
    fn abort(&mut self) {
        self.active = false;
        self.sdu.clear();
    }
}

/// Reassembles framed SDUs from segmented PDUs, one stream per BIS handle.
#[derive(Debug, Default)]
pub struct IsoAssembler {
    streams: FnvIndexMap<u16, FramedState, MAX_BIS>,
}

impl IsoAssembler {
    fn stream(&mut self, handle: u16) -> Option<&mut FramedState> {
        if !self.streams.contains_key(&handle) && self.streams.insert(handle, FramedState::default()).is_err() {
            return None;
        }
        self.streams.get_mut(&handle)
    }

    /// Feeds one decrypted framed PDU payload; completed SDUs and losses go to `emit`.
    pub fn push_pdu<F>(&mut self, handle: u16, payload: &[u8], mut emit: F)
    where
        F: FnMut(FramedEvent<'_>),
    {
        let Some(st) = self.stream(handle) else {
            return;
        };

        let mut pos = 0;
        while pos < payload.len() {
            let (hdr, used) = match FramedSegHeader::parse(&payload[pos..]) {
                Ok(h) => h,
                Err(e) => {
                    debug!(bis_handle = handle, error = %e, "bad segment header");
                    if st.active {
                        st.abort();
                        emit(FramedEvent::Lost);
                    }
                    return;
                }
            };

            let start = pos + used;
            let end = start + hdr.data_len();
            if end > payload.len() {
                debug!(bis_handle = handle, "segment overruns PDU");
                if st.active {
                    st.abort();
                    emit(FramedEvent::Lost);
                }
                return;
            }
            pos = end;

            if !hdr.sc {
                if st.active {
                    emit(FramedEvent::Lost);
                }
                st.abort();
                st.active = true;
                st.time_offset = hdr.time_offset.unwrap_or(0);
            } else if !st.active {
                // Continuation of an SDU whose start we never saw
                continue;
            }

            if st.sdu.extend_from_slice(&payload[start..end]).is_err() {
                st.abort();
                emit(FramedEvent::Lost);
                continue;
            }

            if hdr.cmplt {
                emit(FramedEvent::Sdu { data: &st.sdu, time_offset: st.time_offset });
                st.abort();
            }
        }
    }

    /// A PDU of the stream was not received: drop any partial SDU and report the loss.
    pub fn mark_missing<F>(&mut self, handle: u16, mut emit: F)
    where
        F: FnMut(FramedEvent<'_>),
    {
        if let Some(st) = self.stream(handle) {
            st.abort();
            emit(FramedEvent::Lost);
        }
    }

    pub fn remove(&mut self, handle: u16) {
        self.streams.remove(&handle);
    }
}
