#[cfg(not(windows))]
mod fuzz {
    use fwimage::format::meta::{self, Meta};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok((meta, offset)) = Meta::parse(data) {
                    let _ = meta.flash_areas();
                    let _ = meta.mmr_refs();
                    let _ = meta::recalc_hash(&meta, offset, data, 0xff);
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
