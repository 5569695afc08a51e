use crate::sdk::packet_types::MIC_LEN;

/// AES-128 block encryption primitive, supplied by the radio's crypto engine.
pub trait AesBlock {
    fn aes128_encrypt(&self, key: &[u8; 16], block: &mut [u8; 16]);
}

// Salts and key IDs of the BIG key hierarchy, most significant octet first.
const SALT_BIG1: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, b'B', b'I', b'G', b'1'];
const KEY_ID_BIG2: [u8; 4] = *b"BIG2";
const KEY_ID_BIG3: [u8; 4] = *b"BIG3";

const CCM_FLAGS_B0: u8 = 0x49; // Adata, M = 4, L = 2
const CCM_FLAGS_A: u8 = 0x01; // L = 2
const CCM_NONCE_LEN: usize = 13;

fn xor_block(dst: &mut [u8; 16], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

fn shift_left_one(block: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut carry = 0;
    for i in (0..16).rev() {
        out[i] = (block[i] << 1) | carry;
        carry = block[i] >> 7;
    }
    out
}

fn cmac_subkey(block: &[u8; 16]) -> [u8; 16] {
    let mut k = shift_left_one(block);
    if block[0] & 0x80 != 0 {
        k[15] ^= 0x87;
    }
    k
}

/// AES-CMAC (RFC 4493).
pub fn aes_cmac<A: AesBlock + ?Sized>(aes: &A, key: &[u8; 16], msg: &[u8]) -> [u8; 16] {
    let mut l = [0u8; 16];
    aes.aes128_encrypt(key, &mut l);
    let k1 = cmac_subkey(&l);
    let k2 = cmac_subkey(&k1);

    let blocks = if msg.is_empty() { 1 } else { (msg.len() + 15) / 16 };
    let complete = !msg.is_empty() && msg.len() % 16 == 0;

    let mut last = [0u8; 16];
    let tail = &msg[(blocks - 1) * 16..];
    last[..tail.len()].copy_from_slice(tail);
    if complete {
        xor_block(&mut last, &k1);
    } else {
        last[tail.len()] = 0x80;
        xor_block(&mut last, &k2);
    }

    let mut x = [0u8; 16];
    for chunk in msg.chunks(16).take(blocks - 1) {
        xor_block(&mut x, chunk);
        aes.aes128_encrypt(key, &mut x);
    }
    xor_block(&mut x, &last);
    aes.aes128_encrypt(key, &mut x);

    x
}

pub fn h6<A: AesBlock + ?Sized>(aes: &A, w: &[u8; 16], key_id: &[u8; 4]) -> [u8; 16] {
    aes_cmac(aes, w, key_id)
}

pub fn h7<A: AesBlock + ?Sized>(aes: &A, salt: &[u8; 16], w: &[u8; 16]) -> [u8; 16] {
    aes_cmac(aes, salt, w)
}

pub fn h8<A: AesBlock + ?Sized>(aes: &A, k: &[u8; 16], s: &[u8; 16], key_id: &[u8; 4]) -> [u8; 16] {
    let ik = aes_cmac(aes, s, k);
    aes_cmac(aes, &ik, key_id)
}

/// Group session key from the Broadcast_Code and the GSKD carried in BIG Info.
pub fn derive_gsk<A: AesBlock + ?Sized>(aes: &A, broadcast_code: &[u8; 16], gskd: &[u8; 16]) -> [u8; 16] {
    let igltk = h7(aes, &SALT_BIG1, broadcast_code);
    let gltk = h6(aes, &igltk, &KEY_ID_BIG2);
    h8(aes, &gltk, gskd, &KEY_ID_BIG3)
}

/// Per-BIS IV: GIV with its low word XORed with the stream's access address.
pub fn bis_iv(giv: &[u8; 8], access_addr: u32) -> [u8; 8] {
    let mut iv = *giv;
    for (b, a) in iv[..4].iter_mut().zip(access_addr.to_le_bytes()) {
        *b ^= a;
    }
    iv
}

pub fn ccm_nonce(pkt_ctr: u64, dir: bool, iv: &[u8; 8]) -> [u8; CCM_NONCE_LEN] {
    let mut nonce = [0u8; CCM_NONCE_LEN];
    nonce[..5].copy_from_slice(&(pkt_ctr & 0x7F_FFFF_FFFF).to_le_bytes()[..5]);
    if dir {
        nonce[4] |= 0x80;
    }
    nonce[5..].copy_from_slice(iv);
    nonce
}

fn ccm_cbc_mac<A: AesBlock + ?Sized>(aes: &A, key: &[u8; 16], nonce: &[u8; CCM_NONCE_LEN], aad: u8, data: &[u8]) -> [u8; 16] {
    let mut x = [0u8; 16];
    x[0] = CCM_FLAGS_B0;
    x[1..14].copy_from_slice(nonce);
    x[14..].copy_from_slice(&(data.len() as u16).to_be_bytes());
    aes.aes128_encrypt(key, &mut x);

    // One octet of additional data, length prefixed.
    xor_block(&mut x, &[0x00, 0x01, aad]);
    aes.aes128_encrypt(key, &mut x);

    for chunk in data.chunks(16) {
        xor_block(&mut x, chunk);
        aes.aes128_encrypt(key, &mut x);
    }
    x
}

fn ccm_keystream_block<A: AesBlock + ?Sized>(aes: &A, key: &[u8; 16], nonce: &[u8; CCM_NONCE_LEN], i: u16) -> [u8; 16] {
    let mut a = [0u8; 16];
    a[0] = CCM_FLAGS_A;
    a[1..14].copy_from_slice(nonce);
    a[14..].copy_from_slice(&i.to_be_bytes());
    aes.aes128_encrypt(key, &mut a);
    a
}

fn ccm_ctr<A: AesBlock + ?Sized>(aes: &A, key: &[u8; 16], nonce: &[u8; CCM_NONCE_LEN], data: &mut [u8]) {
    for (i, chunk) in data.chunks_mut(16).enumerate() {
        let s = ccm_keystream_block(aes, key, nonce, i as u16 + 1);
        for (d, k) in chunk.iter_mut().zip(s) {
            *d ^= k;
        }
    }
}

pub fn ccm_encrypt<A: AesBlock + ?Sized>(aes: &A, key: &[u8; 16], nonce: &[u8; CCM_NONCE_LEN], aad: u8, data: &mut [u8]) -> [u8; MIC_LEN] {
    let t = ccm_cbc_mac(aes, key, nonce, aad, data);
    ccm_ctr(aes, key, nonce, data);

    let s0 = ccm_keystream_block(aes, key, nonce, 0);
    let mut mic = [0u8; MIC_LEN];
    for i in 0..MIC_LEN {
        mic[i] = t[i] ^ s0[i];
    }
    mic
}

/// Decrypts in place; returns `false` on MIC mismatch, leaving `data` unspecified.
pub fn ccm_decrypt<A: AesBlock + ?Sized>(aes: &A, key: &[u8; 16], nonce: &[u8; CCM_NONCE_LEN], aad: u8, data: &mut [u8], mic: &[u8]) -> bool {
    if mic.len() != MIC_LEN {
        return false;
    }

    ccm_ctr(aes, key, nonce, data);
    let t = ccm_cbc_mac(aes, key, nonce, aad, data);
    let s0 = ccm_keystream_block(aes, key, nonce, 0);

    let mut diff = 0u8;
    for i in 0..MIC_LEN {
        diff |= (t[i] ^ s0[i]) ^ mic[i];
    }
    diff == 0
}

/// Encryption context of one BIS or of the BIG control subevent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BisEncCtx {
    pub enabled: bool,
    pub sk: [u8; 16],
    pub iv: [u8; 8],
    pub dir: bool,
}

impl BisEncCtx {
    pub fn new(gsk: &[u8; 16], giv: &[u8; 8], access_addr: u32) -> Self {
        Self { enabled: true, sk: *gsk, iv: bis_iv(giv, access_addr), dir: true }
    }

    /// Decrypts `payload` (ciphertext followed by the MIC) in place.
    /// Returns the plaintext length, or `None` if authentication failed.
    pub fn decrypt_pdu<A: AesBlock + ?Sized>(&self, aes: &A, pkt_ctr: u64, hdr0: u8, payload: &mut [u8]) -> Option<usize> {
        if !self.enabled {
            return Some(payload.len());
        }
        if payload.len() < MIC_LEN {
            return None;
        }

        let len = payload.len() - MIC_LEN;
        let (data, mic) = payload.split_at_mut(len);
        let nonce = ccm_nonce(pkt_ctr, self.dir, &self.iv);
        let aad = hdr0 & crate::sdk::packet_types::BisPduHeader::AAD_MASK;

        if ccm_decrypt(aes, &self.sk, &nonce, aad, data, mic) {
            Some(len)
        } else {
            None
        }
    }

    /// Broadcaster side of [`BisEncCtx::decrypt_pdu`]; `payload` must have room for the MIC.
    pub fn encrypt_pdu<A: AesBlock + ?Sized>(&self, aes: &A, pkt_ctr: u64, hdr0: u8, payload: &mut [u8]) -> Option<usize> {
        if !self.enabled {
            return Some(payload.len());
        }
        if payload.len() < MIC_LEN {
            return None;
        }

        let len = payload.len() - MIC_LEN;
        let (data, mic) = payload.split_at_mut(len);
        let nonce = ccm_nonce(pkt_ctr, self.dir, &self.iv);
        let aad = hdr0 & crate::sdk::packet_types::BisPduHeader::AAD_MASK;

        mic.copy_from_slice(&ccm_encrypt(aes, &self.sk, &nonce, aad, data));
        Some(payload.len())
    }
}
