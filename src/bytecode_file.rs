//! The bytecode-file format: a text header plus a binary body (`spec.md`
//! §6). Lines in the header are LF-terminated ASCII; each function's raw
//! bytecode is embedded inline, length-prefixed by an ASCII decimal line
//! rather than null-terminated, since bytecode can itself contain zero
//! bytes.
//!
//! A trailing checksum line (not in the original `runtime.c` loader, added
//! per `SPEC_FULL.md` §A) guards against truncated or hand-edited files:
//! `crc32fast` gives a cheap first check, a `sha2` digest is the
//! authoritative one, matching how `raya-engine`'s
//! `compiler::bytecode::Module` carries a `[u8; 32] checksum` field.

use crate::error::{LinguineError, LinguineResult};
use crate::lir::LirFunc;
use sha2::{Digest, Sha256};
use std::io::Write as _;
use std::path::Path;

const MAGIC: &str = "Linguine Bytecode";

fn load_failed() -> LinguineError {
    LinguineError::load("Failed to load bytecode.")
}

fn body_digest(body: &[u8]) -> (u32, String) {
    let crc = crc32fast::hash(body);
    let mut hasher = Sha256::new();
    hasher.update(body);
    (crc, hex::encode(hasher.finalize()))
}

/// Serialize `funcs` into the on-disk format, returning the raw bytes.
pub fn write_to_vec(source_path: &str, funcs: &[LirFunc]) -> Vec<u8> {
    let mut body = Vec::new();
    for func in funcs {
        body.extend_from_slice(b"Begin Function\n");
        write_line(&mut body, "Name", &func.name);
        write_line(&mut body, "Parameters", &func.param_names.len().to_string());
        for p in &func.param_names {
            body.extend_from_slice(p.as_bytes());
            body.push(b'\n');
        }
        write_line(&mut body, "Local Size", &func.tmpvar_size.to_string());
        write_line(&mut body, "Bytecode Size", &func.bytecode.len().to_string());
        body.extend_from_slice(&func.bytecode);
        body.extend_from_slice(b"End Function\n");
    }

    let (crc, sha) = body_digest(&body);

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC.as_bytes());
    out.push(b'\n');
    write_line(&mut out, "Source", source_path);
    write_line(&mut out, "Number Of Functions", &funcs.len().to_string());
    write_line(&mut out, "Checksum", &sha);
    write_line(&mut out, "Checksum32", &format!("{crc:08x}"));
    out.extend_from_slice(&body);
    out
}

fn write_line(out: &mut Vec<u8>, key: &str, value: &str) {
    out.extend_from_slice(key.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(value.as_bytes());
    out.push(b'\n');
}

pub fn write_file(path: impl AsRef<Path>, source_path: &str, funcs: &[LirFunc]) -> LinguineResult<()> {
    let bytes = write_to_vec(source_path, funcs);
    let mut f = std::fs::File::create(path).map_err(|e| LinguineError::load(format!("Failed to load bytecode.: {e}")))?;
    f.write_all(&bytes).map_err(|e| LinguineError::load(format!("Failed to load bytecode.: {e}")))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn line(&mut self) -> LinguineResult<&'a str> {
        let rest = &self.data[self.pos..];
        let nl = rest.iter().position(|&b| b == b'\n').ok_or_else(load_failed)?;
        let line = std::str::from_utf8(&rest[..nl]).map_err(|_| load_failed())?;
        self.pos += nl + 1;
        Ok(line)
    }

    fn expect(&mut self, key: &str) -> LinguineResult<()> {
        if self.line()? == key {
            Ok(())
        } else {
            Err(load_failed())
        }
    }

    fn value(&mut self) -> LinguineResult<&'a str> {
        self.line()
    }

    fn usize_value(&mut self) -> LinguineResult<usize> {
        self.value()?.parse().map_err(|_| load_failed())
    }

    fn bytes(&mut self, n: usize) -> LinguineResult<Vec<u8>> {
        if self.pos + n > self.data.len() {
            return Err(load_failed());
        }
        let out = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }
}

/// Parse the on-disk format, returning the source path and every function.
/// Any deviation from the expected shape aborts with "Failed to load
/// bytecode." (`spec.md` §6), after the checksum is verified.
pub fn read_from_slice(data: &[u8]) -> LinguineResult<(String, Vec<LirFunc>)> {
    let mut r = Reader { data, pos: 0 };
    if r.line()? != MAGIC {
        return Err(load_failed());
    }
    r.expect("Source")?;
    let source_path = r.value()?.to_string();
    r.expect("Number Of Functions")?;
    let n = r.usize_value()?;
    r.expect("Checksum")?;
    let expected_sha = r.value()?.to_string();
    r.expect("Checksum32")?;
    let expected_crc = u32::from_str_radix(r.value()?, 16).map_err(|_| load_failed())?;

    let body = &data[r.pos..];
    let (crc, sha) = body_digest(body);
    if crc != expected_crc || sha != expected_sha {
        return Err(LinguineError::load("Failed to load bytecode."));
    }

    let mut funcs = Vec::with_capacity(n);
    for _ in 0..n {
        r.expect("Begin Function")?;
        r.expect("Name")?;
        let name = r.value()?.to_string();
        r.expect("Parameters")?;
        let k = r.usize_value()?;
        let mut param_names = Vec::with_capacity(k);
        for _ in 0..k {
            param_names.push(r.value()?.to_string());
        }
        r.expect("Local Size")?;
        let tmpvar_size: u16 = r.value()?.parse().map_err(|_| load_failed())?;
        r.expect("Bytecode Size")?;
        let size = r.usize_value()?;
        let bytecode = r.bytes(size)?;
        r.expect("End Function")?;

        funcs.push(LirFunc {
            name,
            file_name: source_path.clone(),
            param_names,
            tmpvar_size,
            bytecode,
        });
    }

    if funcs.len() != n {
        return Err(load_failed());
    }

    Ok((source_path, funcs))
}

pub fn read_file(path: impl AsRef<Path>) -> LinguineResult<(String, Vec<LirFunc>)> {
    let data = std::fs::read(path).map_err(|_| load_failed())?;
    read_from_slice(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_func() -> LirFunc {
        LirFunc {
            name: "main".to_string(),
            file_name: "a.lgn".to_string(),
            param_names: vec!["x".to_string(), "y".to_string()],
            tmpvar_size: 4,
            bytecode: vec![0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07],
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let funcs = vec![sample_func()];
        let bytes = write_to_vec("a.lgn", &funcs);
        let (source, back) = read_from_slice(&bytes).unwrap();
        assert_eq!(source, "a.lgn");
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].name, "main");
        assert_eq!(back[0].param_names, vec!["x", "y"]);
        assert_eq!(back[0].tmpvar_size, 4);
        assert_eq!(back[0].bytecode, sample_func().bytecode);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.lgnc");
        let funcs = vec![sample_func()];
        write_file(&path, "a.lgn", &funcs).unwrap();
        let (_, back) = read_file(&path).unwrap();
        assert_eq!(back.len(), 1);
    }

    #[test]
    fn rejects_corrupted_body() {
        let funcs = vec![sample_func()];
        let mut bytes = write_to_vec("a.lgn", &funcs);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(read_from_slice(&bytes).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = b"Not Linguine Bytecode\n".to_vec();
        assert!(read_from_slice(&bytes).is_err());
    }
}
