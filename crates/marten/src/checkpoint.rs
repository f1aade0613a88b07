use crate::architecture::Architecture;
use crate::init::Initializer;
use crate::modifiers::ValueModifier;
use crate::network::Network;
use crate::rules::ReferenceMap;
use marten_core::{Error, Handler, HostArray, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

// Checkpoint — the network container format (.marten)
//
//   Header:
//     magic:    [u8; 4]  = b"MRTN"
//     version:  u32 LE   = 1
//
//   Description:
//     desc_len: u64 LE
//     desc:     [u8; desc_len]   JSON: architecture, handler identity,
//                                initializer and modifier references
//
//   Parameters:
//     count:    u64 LE           number of f64 elements
//     data:     [u8; count * 8]  flat little-endian parameter dump
//
// Loading rebuilds the layout from the description and restores the
// parameter region byte-identically.

const MAGIC: &[u8; 4] = b"MRTN";
const VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Description {
    architecture: Architecture,
    handler: String,
    initializers: ReferenceMap<Initializer>,
    weight_modifiers: ReferenceMap<Vec<ValueModifier>>,
    gradient_modifiers: ReferenceMap<Vec<ValueModifier>>,
}

/// Save a network: JSON description plus flat parameter dump.
pub fn save<H: Handler>(network: &Network<H>, path: impl AsRef<Path>) -> Result<()> {
    let description = Description {
        architecture: network.architecture().clone(),
        handler: network.handler().name().to_string(),
        initializers: network.initializer_refs().clone(),
        weight_modifiers: network.weight_modifier_refs().clone(),
        gradient_modifiers: network.gradient_modifier_refs().clone(),
    };
    let desc_bytes = serde_json::to_vec(&description)?;
    let params = network.parameters()?;

    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(desc_bytes.len() as u64).to_le_bytes())?;
    w.write_all(&desc_bytes)?;
    w.write_all(&(params.len() as u64).to_le_bytes())?;
    for &x in params.data() {
        w.write_all(&x.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

/// Load a network saved with [`save`], reconstructing an identical layout
/// and byte-identical parameter values.
pub fn load<H: Handler>(path: impl AsRef<Path>, handler: H) -> Result<Network<H>> {
    let mut r = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::network("not a marten checkpoint (bad magic)".to_string()));
    }
    let version = read_u32(&mut r)?;
    if version != VERSION {
        return Err(Error::network(format!(
            "unsupported checkpoint version {}",
            version
        )));
    }

    let desc_len = read_u64(&mut r)? as usize;
    let mut desc_bytes = vec![0u8; desc_len];
    r.read_exact(&mut desc_bytes)?;
    let description: Description = serde_json::from_slice(&desc_bytes)?;
    if description.handler != handler.name() {
        log::warn!(
            "checkpoint was saved with handler '{}', loading with '{}'",
            description.handler,
            handler.name()
        );
    }

    let mut network = Network::from_architecture(description.architecture, handler)?;
    network.restore_descriptions(
        description.initializers,
        description.weight_modifiers,
        description.gradient_modifiers,
    )?;

    let count = read_u64(&mut r)? as usize;
    let mut data = Vec::with_capacity(count);
    let mut buf = [0u8; 8];
    for _ in 0..count {
        r.read_exact(&mut buf)?;
        data.push(f64::from_le_bytes(buf));
    }
    network.set_parameters(&HostArray::new(count, data)?)?;
    Ok(network)
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
