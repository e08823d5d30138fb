#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use fwimage::{format::legacy::LegacyImage, stream::FromReader};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let reader = Cursor::new(data);
                if let Ok(image) = LegacyImage::from_reader(reader) {
                    let _ = image.hash();
                    let _ = image.calc_hash(None);
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
