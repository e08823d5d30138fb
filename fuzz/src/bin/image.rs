#[cfg(not(windows))]
mod fuzz {
    use fwimage::{format::image::Image, verify};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(image) = Image::parse(data) {
                    let _ = verify::verify_structure(&image);
                    let _ = image.calc_hash(None);
                    let _ = image.to_bytes();
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
