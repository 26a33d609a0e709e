//! Iterate over the pages of a document as RGB rasters.

use std::{collections::BTreeMap, fs, process::Output, sync::LazyLock, vec};

use clap::Args;
use image::{ImageReader, RgbImage};
use regex::Regex;
use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*};

/// Image types we accept as single-page documents.
const SUPPORTED_IMAGE_TYPES: &[&str] =
    &["image/png", "image/jpeg", "image/webp", "image/gif"];

/// PDF MIME type.
const PDF_MIME_TYPE: &str = "application/pdf";

/// A default error regex for checking command output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// One page of a document.
#[derive(Debug)]
pub struct Page {
    /// Zero-based position in the document.
    pub index: usize,
    /// The page, decoded.
    pub image: RgbImage,
}

/// Options for constructing a [`PageIter`].
#[derive(Args, Clone, Debug)]
pub struct PageIterOptions {
    /// The DPI to use when rasterizing PDFs.
    #[clap(long, default_value = "300")]
    pub rasterize_dpi: u32,

    /// The maximum number of pages to process. If this is set, we will
    /// stop processing after this many pages and record a warning.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

impl Default for PageIterOptions {
    fn default() -> Self {
        Self {
            rasterize_dpi: 300,
            max_pages: None,
        }
    }
}

/// An iterator over the pages of a PDF or image, in document order.
///
/// PDFs are rasterized up front with Poppler's `pdftocairo`, but pages are
/// only decoded as they're requested. Decoding is slow, so call this from a
/// blocking thread.
pub struct PageIter {
    /// An optional temporary directory, which holds rasterized pages.
    ///
    /// This is released by [`Drop`].
    tmpdir: Option<tempfile::TempDir>,
    /// Page files, in order.
    dir_iter: vec::IntoIter<PathBuf>,
    /// Index of the next page we'll return.
    next_index: usize,
    /// Number of pages in the document.
    total_pages: usize,
    /// The maximum number of pages we are allowed to process.
    max_pages: Option<usize>,
    /// Any warnings that occurred while processing the document.
    warnings: Vec<String>,
}

impl PageIter {
    /// Create a new [`PageIter`] from a path, based on the detected MIME type.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(
        path: &Path,
        options: &PageIterOptions,
        password: Option<&str>,
    ) -> Result<Self> {
        let mime_type = get_mime_type(path)?;
        if SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
            Ok(Self {
                tmpdir: None,
                dir_iter: vec![path.to_owned()].into_iter(),
                next_index: 0,
                total_pages: 1,
                max_pages: options.max_pages,
                warnings: vec![],
            })
        } else if mime_type == PDF_MIME_TYPE {
            Self::from_rasterized_pdf(path, options, password).await
        } else {
            Err(anyhow!(
                "unsupported MIME type {} for {:?} (supported: PDF, PNG, JPEG, WebP, GIF)",
                mime_type,
                path.display()
            ))
        }
    }

    /// Create a new [`PageIter`] from a PDF file, rasterizing each page.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), dpi = options.rasterize_dpi))]
    async fn from_rasterized_pdf(
        path: &Path,
        options: &PageIterOptions,
        password: Option<&str>,
    ) -> Result<Self> {
        let total_pages = get_pdf_page_count(path, password).await?;

        // pdftocairo adds zero-padded page numbers to this name.
        let filename = path
            .file_name()
            .context("failed to get filename from PDF path")?;

        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let out_path = tmpdir.path().join(filename).with_extension("");

        // `pdftocairo` will use _at least_ 100% of a CPU, so take a permit.
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png")
            .arg("-r")
            .arg(options.rasterize_dpi.to_string());
        if let Some(password) = password {
            cmd.arg("-opw").arg(password);
        }
        add_last_page_arg_if_needed(options, total_pages, &mut cmd);
        let output = with_cpu_semaphore(|| async {
            cmd.arg(path).arg(out_path).output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;
        Self::from_tempdir(options, tmpdir, total_pages, &output)
    }

    /// Create a [`PageIter`] from a [`tempfile::TempDir`] full of files
    /// named in lexical order.
    fn from_tempdir(
        options: &PageIterOptions,
        tmpdir: tempfile::TempDir,
        total_pages: usize,
        output: &Output,
    ) -> Result<Self> {
        let tmpdir_path = tmpdir.path();
        let mut dir_paths = tmpdir_path
            .read_dir()
            .with_context(|| {
                format!(
                    "failed to read temporary directory {:?}",
                    tmpdir_path.display()
                )
            })?
            .map(|entry| {
                let entry = entry.with_context(|| {
                    format!(
                        "failed to read entry in temporary directory {:?}",
                        tmpdir_path.display()
                    )
                })?;
                Ok(entry.path())
            })
            .collect::<Result<Vec<_>>>()?;
        dir_paths.sort();

        // Anything the tool printed is worth keeping with the report.
        let warnings = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(|line| line.trim().to_owned())
            .filter(|line| !line.is_empty())
            .collect();

        Ok(Self {
            tmpdir: Some(tmpdir),
            dir_iter: dir_paths.into_iter(),
            next_index: 0,
            total_pages,
            max_pages: options.max_pages,
            warnings,
        })
    }

    /// Number of pages in the whole document, including any we'll skip.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Get any warnings that occurred while processing the document.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Will this iterator return only an incomplete set of pages?
    pub fn is_incomplete(&self) -> bool {
        if let Some(max_pages) = self.max_pages {
            self.total_pages > max_pages
        } else {
            false
        }
    }

    /// If this iterator will return only an incomplete set of pages, say so.
    pub fn incomplete_warning(&self) -> Option<String> {
        match self.max_pages {
            Some(max_pages) if self.is_incomplete() => Some(format!(
                "Only {}/{} pages processed (because of --max-pages)",
                max_pages, self.total_pages
            )),
            _ => None,
        }
    }
}

impl Drop for PageIter {
    fn drop(&mut self) {
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

impl Iterator for PageIter {
    type Item = Result<Page>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.max_pages.is_some_and(|max| self.next_index >= max) {
            return None;
        }
        let path = self.dir_iter.next()?;
        let index = self.next_index;
        self.next_index += 1;

        let image = match decode_page(&path) {
            Ok(image) => image,
            Err(err) => return Some(Err(err.context(format!("failed to decode page {}", index)))),
        };

        // Delete rasterized pages to recover space a bit early.
        if self.tmpdir.is_some()
            && let Err(err) = fs::remove_file(&path)
        {
            warn!(path = %path.display(), "failed to delete page file: {}", err);
        }

        Some(Ok(Page { index, image }))
    }
}

/// Decode an image file, trusting its contents over its extension.
fn decode_page(path: &Path) -> Result<RgbImage> {
    let image = ImageReader::open(path)
        .with_context(|| format!("failed to open {:?}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to read {:?}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode image {:?}", path.display()))?;
    Ok(image.to_rgb8())
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path, password: Option<&str>) -> Result<usize> {
    let mut cmd = Command::new("pdfinfo");
    if let Some(password) = password {
        cmd.arg("-opw").arg(password);
    }
    let output = cmd
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();

    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str.parse::<usize>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Add a "last page" argument to a [`Command`].
fn add_last_page_arg_if_needed(
    options: &PageIterOptions,
    total_pages: usize,
    cmd: &mut Command,
) {
    if let Some(max_pages) = options.max_pages
        && total_pages > max_pages
    {
        // Poppler page numbers are 1-based and the range is inclusive.
        cmd.arg("-l").arg(max_pages.to_string());
    }
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use image::Rgb;

    use super::*;

    /// Write a minimal PDF with `pages` blank US Letter pages.
    pub(crate) fn write_blank_pdf(path: &Path, pages: usize) {
        let mut objects = vec![
            "<< /Type /Catalog /Pages 2 0 R >>".to_owned(),
            format!(
                "<< /Type /Pages /Kids [{}] /Count {} >>",
                (0..pages)
                    .map(|i| format!("{} 0 R", i + 3))
                    .collect::<Vec<_>>()
                    .join(" "),
                pages
            ),
        ];
        for _ in 0..pages {
            objects.push("<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>".to_owned());
        }

        let mut pdf = String::from("%PDF-1.4\n");
        let mut offsets = vec![];
        for (i, object) in objects.iter().enumerate() {
            offsets.push(pdf.len());
            pdf.push_str(&format!("{} 0 obj\n{}\nendobj\n", i + 1, object));
        }
        let xref_offset = pdf.len();
        pdf.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
        for offset in offsets {
            pdf.push_str(&format!("{:010} 00000 n \n", offset));
        }
        pdf.push_str(&format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_offset
        ));
        fs::write(path, pdf).unwrap();
    }

    #[test]
    fn is_error_line_works() {
        assert!(is_error_line("error: something went wrong"));
        assert!(is_error_line("ERROR: something went wrong"));
        assert!(!is_error_line("Warning: something is odd"));
        assert!(!is_error_line(
            "Internal Error: xref num 1234 not found but needed, document has changes, reconstruct aborted"
        ));
    }

    #[tokio::test]
    async fn images_are_single_pages() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scan.jpg");
        RgbImage::from_pixel(40, 30, Rgb([200, 10, 10])).save(&path)?;

        let iter = PageIter::from_path(&path, &PageIterOptions::default(), None).await?;
        assert_eq!(iter.total_pages(), 1);
        assert!(!iter.is_incomplete());
        let pages = iter.collect::<Result<Vec<_>>>()?;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].index, 0);
        assert_eq!(pages[0].image.dimensions(), (40, 30));
        // Images are never deleted, only rasterized pages.
        assert!(path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_files_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, "just some text")?;
        assert!(
            PageIter::from_path(&path, &PageIterOptions::default(), None)
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_files_are_rejected() {
        let result = PageIter::from_path(
            Path::new("/definitely/not/here.pdf"),
            &PageIterOptions::default(),
            None,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn page_count_returns_correct_number_of_pages() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("two_pages.pdf");
        write_blank_pdf(&path, 2);
        assert_eq!(get_pdf_page_count(&path, None).await?, 2);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn pdf_pages_arrive_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("three_pages.pdf");
        write_blank_pdf(&path, 3);
        let options = PageIterOptions {
            rasterize_dpi: 72,
            max_pages: None,
        };
        let pages = PageIter::from_path(&path, &options, None)
            .await?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(
            pages.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(pages[0].image.dimensions(), (612, 792));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn page_iter_obeys_max_pages() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("two_pages.pdf");
        write_blank_pdf(&path, 2);
        let options = PageIterOptions {
            rasterize_dpi: 72,
            max_pages: Some(1),
        };
        let iter = PageIter::from_path(&path, &options, None).await?;
        assert!(iter.is_incomplete());
        assert!(iter.incomplete_warning().is_some());
        let pages = iter.collect::<Result<Vec<_>>>()?;
        assert_eq!(pages.len(), 1);
        Ok(())
    }
}
