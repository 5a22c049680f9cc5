// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! NAR compression codecs.

use async_compression::tokio::bufread::{
    BzDecoder, GzipDecoder, XzDecoder, ZstdDecoder,
};
use async_compression::tokio::write::{BzEncoder, GzipEncoder, XzEncoder, ZstdEncoder};
use tokio::io::{AsyncWriteExt as _, BufReader};

use cadenza_store::{Result, StoreError};

use crate::narinfo::Compression;
use crate::transport::FileStream;

/// Compress an in-memory NAR for upload.
pub async fn compress(codec: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Xz => {
            let mut encoder = XzEncoder::new(Vec::new());
            encoder.write_all(data).await?;
            encoder.shutdown().await?;
            Ok(encoder.into_inner())
        }
        Compression::Bzip2 => {
            let mut encoder = BzEncoder::new(Vec::new());
            encoder.write_all(data).await?;
            encoder.shutdown().await?;
            Ok(encoder.into_inner())
        }
        Compression::Gzip => {
            let mut encoder = GzipEncoder::new(Vec::new());
            encoder.write_all(data).await?;
            encoder.shutdown().await?;
            Ok(encoder.into_inner())
        }
        Compression::Zstd => {
            let mut encoder = ZstdEncoder::new(Vec::new());
            encoder.write_all(data).await?;
            encoder.shutdown().await?;
            Ok(encoder.into_inner())
        }
        Compression::Brotli => Err(StoreError::NotSupported(
            "brotli compression is read-side only here".to_owned(),
        )),
    }
}

/// Wrap a downloaded file stream in the matching decompressor.
pub fn decompress_stream(codec: Compression, stream: FileStream) -> Result<FileStream> {
    let buffered = BufReader::new(stream);
    Ok(match codec {
        Compression::None => Box::pin(buffered),
        Compression::Xz => Box::pin(XzDecoder::new(buffered)),
        Compression::Bzip2 => Box::pin(BzDecoder::new(buffered)),
        Compression::Gzip => Box::pin(GzipDecoder::new(buffered)),
        Compression::Zstd => Box::pin(ZstdDecoder::new(buffered)),
        Compression::Brotli => {
            return Err(StoreError::NotSupported(
                "brotli NARs are not supported".to_owned(),
            ));
        }
    })
}
