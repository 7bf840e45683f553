pub mod analysis;
pub mod capture;
pub mod config;
pub mod inference;
pub mod retry;
pub mod server;

/// Logging and image helpers shared by the server and the capture client
pub mod util {
    use image::ImageFormat;
    use tracing_subscriber::EnvFilter;

    /// Install the global tracing subscriber. `RUST_LOG` wins over the
    /// built-in default filter
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(super::config::RUST_LOG));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Guess the MIME type of an encoded image from its leading bytes
    pub fn sniff_mime_type(bytes: &[u8]) -> Option<&'static str> {
        let mime = match image::guess_format(bytes).ok()? {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::WebP => "image/webp",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Tiff => "image/tiff",
            ImageFormat::Avif => "image/avif",
            _ => return None,
        };
        Some(mime)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn sniffs_common_formats() {
            assert_eq!(
                sniff_mime_type(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
                Some("image/png")
            );
            assert_eq!(sniff_mime_type(b"\xff\xd8\xff\xe0\0\x10JFIF"), Some("image/jpeg"));
            assert_eq!(sniff_mime_type(b"GIF89a"), Some("image/gif"));
            assert_eq!(sniff_mime_type(b"foo"), None);
        }
    }
}
