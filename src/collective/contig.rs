//! Collective I/O on contiguous datasets.

use tracing::{debug, error};

use super::{ActualIoMode, CollectiveError, IoBuf, IoReport, MpiType, MpioFile, Transfer};
use crate::comm::{CommError, Communicator};
use crate::dataset::Dataset;
use crate::layout::{Selection, StorageDescriptor};

/// One collective transfer: the selection's byte runs become the file
/// view at the dataset's address.
pub(super) fn collective_io<C: Communicator>(
    file: &mut MpioFile<C>,
    dset: &Dataset,
    xfer: &Transfer<'_>,
    buf: IoBuf<'_>,
    report: &mut IoReport,
) -> Result<(), CollectiveError> {
    let StorageDescriptor::Contiguous { addr, .. } = dset.descriptor() else {
        return Err(CollectiveError::Internal("contiguous I/O on another layout".into()));
    };
    let runs = xfer.selection.byte_runs(dset.space(), dset.dtype().size());
    let len = buf.len();
    report.io_mode = ActualIoMode::ContiguousCollective;

    match (addr, buf) {
        (Some(addr), buf) => {
            if !runs.is_empty() {
                file.set_view(addr, MpiType::hindexed(&runs)?);
            }
            let result = match buf {
                IoBuf::Read(out) => file.read_at_all(&MpiType::byte(), len, out),
                IoBuf::Write(data) => file.write_at_all(&MpiType::byte(), len, data),
            };
            file.reset_view();
            report.bytes = result?;
        }
        (None, IoBuf::Read(out)) => {
            // Never written: reads as zeros.
            out.fill(0);
            file.read_at_all(&MpiType::byte(), 0, out)?;
            report.bytes = len;
        }
        (None, IoBuf::Write(_)) => {
            return Err(CollectiveError::Internal(
                "contiguous storage written before allocation".into(),
            ));
        }
    }
    debug!(rank = file.rank(), bytes = report.bytes, "contiguous collective I/O done");
    Ok(())
}

/// Rank 0 reads the whole dataset and broadcasts it to the others.
///
/// Only taken when every rank selected everything, so every buffer has
/// the dataset's size.
pub(super) fn rank0_bcast_read<C: Communicator>(
    file: &mut MpioFile<C>,
    dset: &mut Dataset,
    out: &mut [u8],
    report: &mut IoReport,
) -> Result<(), CollectiveError> {
    let payload = if file.rank() == 0 {
        match dset.read_from(file, &Selection::All, out) {
            Ok(_) => out.to_vec(),
            Err(e) => {
                // Release the other ranks before failing.
                if let Err(bcast) = file.comm().bcast(0, Vec::new()) {
                    error!(error = %bcast, "failed to release ranks after rank 0 read error");
                }
                error!(error = %e, "rank 0 whole-dataset read failed");
                return Err(e.into());
            }
        }
    } else {
        Vec::new()
    };

    let data = file.comm().bcast(0, payload)?;
    if data.len() != out.len() {
        return Err(CommError::Protocol(format!(
            "rank 0 broadcast {} bytes, expected {}",
            data.len(),
            out.len()
        ))
        .into());
    }
    if file.rank() != 0 {
        out.copy_from_slice(&data);
    }
    report.io_mode = ActualIoMode::ContiguousCollective;
    report.rank0_bcast = true;
    report.bytes = out.len();
    debug!(rank = file.rank(), bytes = out.len(), "rank 0 broadcast read done");
    Ok(())
}
